//! `consul-cluster` relation wire format
//!
//! The provider (this charm) writes the application databag; requirers
//! decode it with [`EndpointSet::from_databag`]. All list and optional
//! values are JSON encoded; `datacenter` is written raw.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::platform::DatabagContent;

/// Relation endpoint name
pub const CLUSTER_RELATION: &str = "consul-cluster";

/// Current schema version written under [`INTERFACE_VERSION_KEY`]
pub const INTERFACE_VERSION: &str = "1";

pub const INTERFACE_VERSION_KEY: &str = "interface_version";
pub const DATACENTER_KEY: &str = "datacenter";
pub const INTERNAL_GOSSIP_KEY: &str = "internal_gossip_endpoints";
pub const EXTERNAL_GOSSIP_KEY: &str = "external_gossip_endpoints";
pub const INTERNAL_HTTP_KEY: &str = "internal_http_endpoint";
pub const EXTERNAL_HTTP_KEY: &str = "external_http_endpoint";
pub const EXTERNAL_HEALTHCHECK_KEY: &str = "external_gossip_healthcheck_endpoints";

/// Everything a Consul client needs to join the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSet {
    pub datacenter: String,
    pub internal_gossip_endpoints: Vec<String>,
    pub external_gossip_endpoints: Option<Vec<String>>,
    pub internal_http_endpoint: String,
    pub external_http_endpoint: Option<String>,
    pub external_gossip_healthcheck_endpoints: Option<Vec<String>>,
}

impl EndpointSet {
    /// Encode as application databag content
    pub fn to_databag(&self) -> Result<DatabagContent> {
        let mut bag = DatabagContent::new();
        bag.insert(
            INTERFACE_VERSION_KEY.to_string(),
            INTERFACE_VERSION.to_string(),
        );
        bag.insert(DATACENTER_KEY.to_string(), self.datacenter.clone());
        bag.insert(
            INTERNAL_GOSSIP_KEY.to_string(),
            serde_json::to_string(&self.internal_gossip_endpoints)?,
        );
        bag.insert(
            EXTERNAL_GOSSIP_KEY.to_string(),
            serde_json::to_string(&self.external_gossip_endpoints)?,
        );
        bag.insert(
            INTERNAL_HTTP_KEY.to_string(),
            serde_json::to_string(&self.internal_http_endpoint)?,
        );
        bag.insert(
            EXTERNAL_HTTP_KEY.to_string(),
            serde_json::to_string(&self.external_http_endpoint)?,
        );
        bag.insert(
            EXTERNAL_HEALTHCHECK_KEY.to_string(),
            serde_json::to_string(&self.external_gossip_healthcheck_endpoints)?,
        );
        Ok(bag)
    }

    /// Decode a provider databag.
    ///
    /// An empty databag means the provider has not published yet and yields
    /// `Ok(None)`. Anything present but malformed is an error, so partially
    /// written or foreign data is never mistaken for a configuration.
    pub fn from_databag(bag: &DatabagContent) -> Result<Option<Self>> {
        if bag.is_empty() {
            return Ok(None);
        }

        match bag.get(INTERFACE_VERSION_KEY).map(String::as_str) {
            Some(INTERFACE_VERSION) => {}
            Some(other) => {
                return Err(Error::RelationDataError(format!(
                    "unsupported interface version '{other}'"
                )))
            }
            None => {
                return Err(Error::RelationDataError(format!(
                    "missing {INTERFACE_VERSION_KEY}"
                )))
            }
        }

        let datacenter = required(bag, DATACENTER_KEY)?.to_string();
        if datacenter.is_empty() {
            return Err(Error::RelationDataError(format!(
                "{DATACENTER_KEY} is empty"
            )));
        }

        let set = Self {
            datacenter,
            internal_gossip_endpoints: decode(bag, INTERNAL_GOSSIP_KEY)?,
            external_gossip_endpoints: decode(bag, EXTERNAL_GOSSIP_KEY)?,
            internal_http_endpoint: decode(bag, INTERNAL_HTTP_KEY)?,
            external_http_endpoint: decode(bag, EXTERNAL_HTTP_KEY)?,
            external_gossip_healthcheck_endpoints: decode(bag, EXTERNAL_HEALTHCHECK_KEY)?,
        };

        if set.internal_gossip_endpoints.is_empty() {
            return Err(Error::RelationDataError(format!(
                "{INTERNAL_GOSSIP_KEY} is empty"
            )));
        }
        Ok(Some(set))
    }
}

fn required<'a>(bag: &'a DatabagContent, key: &str) -> Result<&'a str> {
    bag.get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::RelationDataError(format!("missing {key}")))
}

fn decode<T: DeserializeOwned>(bag: &DatabagContent, key: &str) -> Result<T> {
    let raw = required(bag, key)?;
    serde_json::from_str(raw)
        .map_err(|e| Error::RelationDataError(format!("{key} is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EndpointSet {
        EndpointSet {
            datacenter: "dc1".to_string(),
            internal_gossip_endpoints: vec!["consul.model.svc:30501".to_string()],
            external_gossip_endpoints: Some(vec!["10.10.0.10:30501".to_string()]),
            internal_http_endpoint: "consul.model.svc:8500".to_string(),
            external_http_endpoint: None,
            external_gossip_healthcheck_endpoints: Some(vec!["10.10.0.10:30501".to_string()]),
        }
    }

    #[test]
    fn test_databag_layout() {
        let bag = sample().to_databag().unwrap();
        assert_eq!(bag[INTERFACE_VERSION_KEY], "1");
        assert_eq!(bag[DATACENTER_KEY], "dc1");
        assert_eq!(bag[INTERNAL_GOSSIP_KEY], r#"["consul.model.svc:30501"]"#);
        assert_eq!(bag[INTERNAL_HTTP_KEY], r#""consul.model.svc:8500""#);
        assert_eq!(bag[EXTERNAL_HTTP_KEY], "null");
    }

    #[test]
    fn test_decode_published_databag() {
        let bag = sample().to_databag().unwrap();
        assert_eq!(EndpointSet::from_databag(&bag).unwrap(), Some(sample()));
    }

    #[test]
    fn test_empty_databag_is_not_configured() {
        assert_eq!(
            EndpointSet::from_databag(&DatabagContent::new()).unwrap(),
            None
        );
    }

    #[test]
    fn test_legacy_flat_schema_rejected() {
        let mut bag = DatabagContent::new();
        bag.insert("datacenter".to_string(), "dc1".to_string());
        bag.insert(
            "server_join_addresses".to_string(),
            r#"["consul.model.svc:8301"]"#.to_string(),
        );
        assert!(EndpointSet::from_databag(&bag).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        let mut bag = sample().to_databag().unwrap();
        bag.insert(INTERNAL_GOSSIP_KEY.to_string(), "not json".to_string());
        let err = EndpointSet::from_databag(&bag).unwrap_err();
        assert!(err.to_string().contains(INTERNAL_GOSSIP_KEY));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut bag = sample().to_databag().unwrap();
        bag.insert(INTERFACE_VERSION_KEY.to_string(), "2".to_string());
        assert!(EndpointSet::from_databag(&bag).is_err());
    }

    #[test]
    fn test_empty_gossip_list_rejected() {
        let mut set = sample();
        set.internal_gossip_endpoints.clear();
        let bag = set.to_databag().unwrap();
        assert!(EndpointSet::from_databag(&bag).is_err());
    }
}
