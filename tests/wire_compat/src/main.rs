fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// Servers may send `40` where Rust serializes `40.0`.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    serde_json::json!(f)
                } else {
                    v.clone()
                }
            }
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
    }

    // --- Upload protocol ---

    #[test]
    fn fixture_init_upload_request() {
        roundtrip_test::<pixdrop_protocol::InitUploadRequest>("init_upload_request.json");
    }

    #[test]
    fn fixture_chunk_header() {
        roundtrip_test::<pixdrop_protocol::ChunkHeader>("chunk_header.json");
    }

    #[test]
    fn fixture_chunk_ack() {
        roundtrip_test::<pixdrop_protocol::ChunkAck>("chunk_ack.json");
    }

    #[test]
    fn fixture_upload_status_response() {
        roundtrip_test::<pixdrop_protocol::UploadStatusResponse>("upload_status_response.json");
    }

    #[test]
    fn fixture_probe_request() {
        roundtrip_test::<pixdrop_protocol::ProbeRequest>("probe_request.json");
    }

    #[test]
    fn fixture_probe_response() {
        roundtrip_test::<pixdrop_protocol::ProbeResponse>("probe_response.json");
    }

    // --- Persisted state ---

    #[test]
    fn fixture_upload_session() {
        roundtrip_test::<pixdrop_session_store::UploadSession>("upload_session.json");
    }

    #[test]
    fn fixture_engine_config() {
        roundtrip_test::<pixdrop_upload::EngineConfig>("engine_config.json");
    }

    // --- Older servers and older session files ---

    #[test]
    fn legacy_status_count_only() {
        let json = r#"{ "uploadedChunkCount": 4 }"#;
        let resp: pixdrop_protocol::UploadStatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.uploaded_chunk_count, 4);
        assert_eq!(resp.progress_percent, 0.0);
        assert!(
            resp.uploaded_chunks.is_none(),
            "missing index list should default to None"
        );
    }

    #[test]
    fn legacy_probe_miss_without_file() {
        let resp: pixdrop_protocol::ProbeResponse =
            serde_json::from_str(r#"{ "exists": false }"#).unwrap();
        assert!(resp.into_hit().is_none());
    }

    #[test]
    fn legacy_session_without_destination() {
        let json = r#"{
            "id": "item-1",
            "sessionId": "upl_1",
            "fileName": "a.png",
            "fileSize": 10,
            "fileDigest": "abc",
            "mimeType": "image/png",
            "chunkSizeBytes": 4,
            "totalChunks": 3,
            "createdAt": 1,
            "lastActivityAt": 2
        }"#;
        let session: pixdrop_session_store::UploadSession = serde_json::from_str(json).unwrap();
        assert!(session.uploaded_chunk_indices.is_empty());
        assert_eq!(
            session.destination_options,
            pixdrop_protocol::DestinationOptions::default()
        );
        assert!(session.is_resumable());
    }

    #[test]
    fn partial_engine_config_uses_defaults() {
        let config: pixdrop_upload::EngineConfig =
            serde_json::from_str(r#"{ "concurrency": 2 }"#).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_concurrency, 6);
        assert_eq!(config.chunk_size_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn init_request_omits_absent_watermark() {
        let mut json = load_fixture("init_upload_request.json");
        json.as_object_mut().unwrap().remove("watermark");
        let req: pixdrop_protocol::InitUploadRequest = serde_json::from_value(json).unwrap();
        let out = serde_json::to_value(&req).unwrap();
        assert!(out.get("watermark").is_none());
    }
}
