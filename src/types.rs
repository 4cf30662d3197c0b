use serde::{Deserialize, Serialize};

/// The request could not be understood
pub const INVALID_REQUEST: i32 = -5;
/// The backend reported that the resource does not exist
pub const NOT_FOUND: i32 = 0;
/// No backend was available, or the backend failed
pub const NO_CLIENT: i32 = -1000;
/// The request handler itself failed
pub const HANDLER_FAILED: i32 = -106;

/// Operation requested over the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOp {
    ReadFile,
    ListDirectory,
}

impl RequestOp {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOp::ReadFile => "read_file",
            RequestOp::ListDirectory => "list_directory",
        }
    }
}

/// A single request delivered by the request channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub id: i64,
    pub op: RequestOp,
    pub url: String,
    /// Accepted for wire compatibility, listings are never recursive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<bool>,
}

impl ExternalRequest {
    pub fn read_file(id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            op: RequestOp::ReadFile,
            url: url.into(),
            subdir: None,
        }
    }

    pub fn list_directory(id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            op: RequestOp::ListDirectory,
            url: url.into(),
            subdir: None,
        }
    }
}

/// Payload of a successful directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryData {
    pub member_urls: Vec<String>,
}

/// Error payload carried back to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub msg: String,
}

/// Response sent back over the request channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalResponse {
    Error { id: i64, error: ErrorBody },
    Directory { id: i64, data: DirectoryData },
    File { id: i64, data: String },
}

impl ExternalResponse {
    pub fn error(id: i64, code: i32, msg: impl Into<String>) -> Self {
        ExternalResponse::Error {
            id,
            error: ErrorBody {
                code,
                msg: msg.into(),
            },
        }
    }

    pub fn invalid_request(id: i64) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn id(&self) -> i64 {
        match self {
            ExternalResponse::Error { id, .. }
            | ExternalResponse::Directory { id, .. }
            | ExternalResponse::File { id, .. } => *id,
        }
    }

    /// The error code, if this is an error response
    pub fn error_code(&self) -> Option<i32> {
        match self {
            ExternalResponse::Error { error, .. } => Some(error.code),
            _ => None,
        }
    }
}

/// Kind of change reported for a URI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    Changed,
}

/// A single entry of a change notification batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    pub uri: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
}

impl FileChange {
    pub fn changed(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            kind: ChangeKind::Changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_shapes() {
        let file = ExternalResponse::File {
            id: 1,
            data: "hello".to_string(),
        };
        assert_eq!(serde_json::to_value(&file).unwrap(), json!({"id": 1, "data": "hello"}));

        let dir = ExternalResponse::Directory {
            id: 2,
            data: DirectoryData {
                member_urls: vec!["s:/A/b".to_string()],
            },
        };
        assert_eq!(
            serde_json::to_value(&dir).unwrap(),
            json!({"id": 2, "data": {"member_urls": ["s:/A/b"]}})
        );

        let err = ExternalResponse::invalid_request(3);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"id": 3, "error": {"code": -5, "msg": "Invalid request"}})
        );
    }

    #[test]
    fn test_request_parsing() {
        let req: ExternalRequest =
            serde_json::from_value(json!({"id": 7, "op": "list_directory", "url": "x:/A"})).unwrap();
        assert_eq!(req, ExternalRequest::list_directory(7, "x:/A"));

        let change = serde_json::to_value(FileChange::changed("x:/A")).unwrap();
        assert_eq!(change, json!({"uri": "x:/A", "type": "Changed"}));
    }
}
