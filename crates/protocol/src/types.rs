use serde::{Deserialize, Serialize};

/// Who can see an uploaded file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

/// Server-side processing applied after assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOptions {
    #[serde(default = "default_true")]
    pub generate_thumbnails: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub strip_metadata: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            generate_thumbnails: true,
            strip_metadata: false,
        }
    }
}

/// Where an upload lands and how it is published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub processing: ProcessingOptions,
}

/// Watermark overlay requested at init time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkOptions {
    pub text: String,
    #[serde(default = "default_position")]
    pub position: String,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
}

/// A file that exists on the server, either freshly assembled or found by
/// an instant-upload probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub url: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail_url: String,
}

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !v
}

fn default_position() -> String {
    "bottom-right".into()
}

fn default_opacity() -> f32 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_serialization() {
        assert_eq!(
            serde_json::to_string(&Visibility::Unlisted).unwrap(),
            "\"unlisted\""
        );
        let v: Visibility = serde_json::from_str("\"private\"").unwrap();
        assert_eq!(v, Visibility::Private);
    }

    #[test]
    fn destination_defaults_from_empty_object() {
        let dest: DestinationOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(dest.folder_id, None);
        assert_eq!(dest.visibility, Visibility::Public);
        assert!(dest.processing.generate_thumbnails);
        assert!(!dest.processing.strip_metadata);
    }

    #[test]
    fn destination_omit_empty() {
        let json = serde_json::to_string(&DestinationOptions::default()).unwrap();
        assert!(!json.contains("folderId"));
        assert!(!json.contains("stripMetadata"));
        assert!(json.contains("\"generateThumbnails\":true"));
    }

    #[test]
    fn watermark_defaults() {
        let wm: WatermarkOptions = serde_json::from_str(r#"{"text":"(c) me"}"#).unwrap();
        assert_eq!(wm.position, "bottom-right");
        assert!((wm.opacity - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn remote_file_field_names() {
        let json = r#"{"id":"f1","name":"cat.jpg","url":"https://cdn/x","size":42,"thumbnailUrl":"https://cdn/t"}"#;
        let file: RemoteFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.size, 42);
        assert_eq!(file.thumbnail_url, "https://cdn/t");
        assert!(file.digest.is_empty());
    }
}
