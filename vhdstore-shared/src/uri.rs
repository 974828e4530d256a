use crate::error::{VhdStoreError, VhdStoreResult};

/// A parsed `vhd+tapdisk://` datapath URI.
///
/// Two shapes are in play:
/// - the URI *returned* by a volume operation embeds the provider's
///   `uri_prefix` and the VDI uuid: `vhd+tapdisk://<prefix><uuid>`.
/// - the URI *consumed* by datapath operations (attach/activate/
///   deactivate/detach/epoch-open/epoch-close) additionally encodes which
///   SR it belongs to, with the SR part and the VDI key separated by the
///   terminal `|`: `vhd+tapdisk://<sr-locator>|<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapathUri {
    pub sr: String,
    pub key: String,
}

const SCHEME: &str = "vhd+tapdisk://";

impl DatapathUri {
    /// Build the externally-visible URI for a freshly created/cloned VDI.
    pub fn build(uri_prefix: &str, vdi_uuid: &str) -> String {
        format!("{SCHEME}{uri_prefix}{vdi_uuid}")
    }

    /// Parse a datapath URI of the form `vhd+tapdisk://<sr>|<key>`.
    ///
    /// Splits on the terminal `|`, the separator the storage provider is
    /// expected to embed between the SR locator and the volume key.
    pub fn parse(uri: &str) -> VhdStoreResult<Self> {
        let rest = uri.strip_prefix(SCHEME).ok_or_else(|| {
            VhdStoreError::ProviderFailure(format!("not a vhd+tapdisk uri: {uri}"))
        })?;

        let (sr, key) = rest.rsplit_once('|').ok_or_else(|| {
            VhdStoreError::ProviderFailure(format!(
                "datapath uri missing '|' separator: {uri}"
            ))
        })?;

        if sr.is_empty() || key.is_empty() {
            return Err(VhdStoreError::ProviderFailure(format!(
                "datapath uri has empty sr or key: {uri}"
            )));
        }

        Ok(Self {
            sr: sr.to_string(),
            key: key.to_string(),
        })
    }
}
