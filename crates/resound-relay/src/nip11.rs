//! NIP-11 relay information document.
//!
//! Served on the websocket endpoint when a client asks with
//! `Accept: application/nostr+json`.

use serde::{Deserialize, Serialize};

/// The HTTP Accept header value that requests relay information.
pub const RELAY_INFO_ACCEPT_HEADER: &str = "application/nostr+json";

/// Relay information document. All fields are optional per NIP-11; absent
/// fields are omitted from the JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayInformationDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Administrative contact's hex public key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_nips: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RelayInformationDocument {
    /// Document describing this relay.
    pub fn new(name: &str, description: &str, contact_pubkey: Option<&str>) -> Self {
        Self {
            name: Some(name.to_string()),
            description: Some(description.to_string()),
            pubkey: contact_pubkey.map(str::to_string),
            contact: contact_pubkey.map(str::to_string),
            supported_nips: Some(vec![1, 11]),
            software: Some("https://github.com/resound-relay/resound".to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_serializes_without_null_fields() {
        let doc = RelayInformationDocument::new("Resound", "A broadcast relay", None);
        let json = serde_json::to_value(&doc).unwrap();

        assert_eq!(json["name"], "Resound");
        assert_eq!(json["supported_nips"], serde_json::json!([1, 11]));
        assert!(json.get("pubkey").is_none());
        assert!(json.get("contact").is_none());
    }

    #[test]
    fn test_document_includes_contact() {
        let doc = RelayInformationDocument::new("Resound", "desc", Some("abcd1234"));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["pubkey"], "abcd1234");
    }
}
