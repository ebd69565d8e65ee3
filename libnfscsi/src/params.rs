//! Typed view of the `CreateVolume` parameter bag.

use std::collections::HashMap;

use crate::error::CsiError;
use crate::types::VolumeId;

/// Key naming the NFS server address.
pub const PARAM_SERVER: &str = "server";
/// Key naming the export path on the server.
pub const PARAM_SHARE: &str = "share";
/// Accepted alias for [`PARAM_SHARE`].
pub const PARAM_EXPORT: &str = "export";

/// Backend connection parameters validated out of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsParameters {
    /// NFS server host or address.
    pub server: String,
    /// Export path on the server.
    pub share: String,
    /// Which key carried the export, so the response context uses the same.
    share_key: &'static str,
    /// Every other key, passed through untouched.
    pub extra: HashMap<String, String>,
}

impl NfsParameters {
    /// Validate the bag.  `server` and `share` (or `export`) are required and
    /// must be non-empty.
    pub fn parse(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let server = required(params, PARAM_SERVER)?;

        let (share_key, share) = match non_empty(params, PARAM_SHARE) {
            Some(share) => (PARAM_SHARE, share),
            None => match non_empty(params, PARAM_EXPORT) {
                Some(export) => (PARAM_EXPORT, export),
                None => {
                    return Err(CsiError::InvalidArgument(format!(
                        "missing required parameter {PARAM_SHARE}"
                    )));
                }
            },
        };

        let extra = params
            .iter()
            .filter(|(k, _)| k.as_str() != PARAM_SERVER && k.as_str() != share_key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            server,
            share,
            share_key,
            extra,
        })
    }

    /// Build from explicit values, e.g. a configured default backend.
    pub fn new(server: impl Into<String>, share: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            share: share.into(),
            share_key: PARAM_SHARE,
            extra: HashMap::new(),
        }
    }

    /// Mount source, `<server>:<share>`.
    pub fn source(&self) -> String {
        format!("{}:{}", self.server, self.share)
    }

    /// Export path of one volume's subdirectory.
    pub fn volume_share(&self, id: &VolumeId) -> String {
        format!("{}/{}", self.share.trim_end_matches('/'), id)
    }

    /// Context handed back to the caller: the original bag with the export
    /// narrowed to the volume's subdirectory.
    pub fn volume_context(&self, id: &VolumeId) -> HashMap<String, String> {
        let mut context = self.extra.clone();
        context.insert(PARAM_SERVER.to_owned(), self.server.clone());
        context.insert(self.share_key.to_owned(), self.volume_share(id));
        context
    }
}

fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn required(params: &HashMap<String, String>, key: &str) -> Result<String, CsiError> {
    non_empty(params, key)
        .ok_or_else(|| CsiError::InvalidArgument(format!("missing required parameter {key}")))
}
