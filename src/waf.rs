use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use aws_sdk_wafv2::error::{DisplayErrorContext, SdkError};
use aws_sdk_wafv2::types as sdk;
use regex::Regex;
use thiserror::Error;

/// What WAFv2 accepts as an IP set description.
pub const DESCRIPTION_PATTERN: &str = r"^[\w+=:#@/\-,\.][\w+=:#@/\-,\.\s]+[\w+=:#@/\-,\.]$";

fn description_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DESCRIPTION_PATTERN).expect("description pattern is valid"))
}

/// Whether the service would accept `description` on create.
pub fn is_valid_description(description: &str) -> bool {
    description.len() <= 256 && description_regex().is_match(description)
}

/// Where a WAF resource lives. CLOUDFRONT sets are only reachable through
/// us-east-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Regional,
    Cloudfront,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Regional => f.write_str("REGIONAL"),
            Scope::Cloudfront => f.write_str("CLOUDFRONT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetSummary {
    pub name: String,
    pub id: String,
}

/// An IP set as read from the service, including the lock token the next
/// update has to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetDetails {
    pub name: String,
    pub id: String,
    pub addresses: Vec<String>,
    pub family: AddressFamily,
    pub lock_token: String,
}

#[derive(Error, Debug)]
pub enum WafError {
    #[error("IP set '{name}' not found in {scope}")]
    NotFound { name: String, scope: Scope },
    #[error("lock token for IP set '{name}' is stale")]
    Conflict { name: String },
    #[error("WAF request failed: {0}")]
    Service(String),
}

/// The IP set calls the replicator needs from one region of the firewall
/// service.
#[async_trait]
pub trait RuleSetService: Send + Sync {
    /// Region label, for logs and descriptions.
    fn region(&self) -> &str;

    async fn list(&self, scope: Scope) -> Result<Vec<IpSetSummary>, WafError>;

    async fn get(&self, scope: Scope, name: &str, id: &str) -> Result<IpSetDetails, WafError>;

    /// Creates a set and returns its id.
    async fn create(
        &self,
        scope: Scope,
        name: &str,
        family: AddressFamily,
        addresses: Vec<String>,
        description: &str,
    ) -> Result<String, WafError>;

    /// Replaces the address list. Fails with [`WafError::Conflict`] when
    /// `lock_token` is no longer current.
    async fn update(
        &self,
        scope: Scope,
        name: &str,
        id: &str,
        addresses: Vec<String>,
        lock_token: &str,
    ) -> Result<(), WafError>;
}

/// AWS WAFv2 in one region.
pub struct Wafv2Service {
    client: aws_sdk_wafv2::Client,
    region: String,
}

impl Wafv2Service {
    pub async fn connect(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_wafv2::config::Region::new(region.to_string()))
            .load()
            .await;
        Wafv2Service {
            client: aws_sdk_wafv2::Client::new(&config),
            region: region.to_string(),
        }
    }
}

impl From<Scope> for sdk::Scope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Regional => sdk::Scope::Regional,
            Scope::Cloudfront => sdk::Scope::Cloudfront,
        }
    }
}

impl From<AddressFamily> for sdk::IpAddressVersion {
    fn from(family: AddressFamily) -> Self {
        match family {
            AddressFamily::Ipv4 => sdk::IpAddressVersion::Ipv4,
            AddressFamily::Ipv6 => sdk::IpAddressVersion::Ipv6,
        }
    }
}

impl TryFrom<&sdk::IpAddressVersion> for AddressFamily {
    type Error = WafError;

    fn try_from(version: &sdk::IpAddressVersion) -> Result<Self, Self::Error> {
        match version {
            sdk::IpAddressVersion::Ipv4 => Ok(AddressFamily::Ipv4),
            sdk::IpAddressVersion::Ipv6 => Ok(AddressFamily::Ipv6),
            other => Err(WafError::Service(format!(
                "unknown IP address version {}",
                other.as_str()
            ))),
        }
    }
}

fn service_error<E, R>(err: SdkError<E, R>) -> WafError
where
    E: std::error::Error + 'static,
    R: fmt::Debug,
{
    WafError::Service(DisplayErrorContext(err).to_string())
}

/// One page of a set listing and the marker for the next one.
struct Page {
    sets: Vec<IpSetSummary>,
    next_marker: Option<String>,
}

/// Follows `next_marker` until it runs out. A page without sets ends the
/// listing even when it still carries a marker.
async fn list_pages<F, Fut>(mut fetch: F) -> Result<Vec<IpSetSummary>, WafError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page, WafError>>,
{
    let mut summaries = Vec::new();
    let mut marker = None;
    loop {
        let page = fetch(marker.take()).await?;
        let empty = page.sets.is_empty();
        summaries.extend(page.sets);
        match page.next_marker {
            Some(next) if !empty => marker = Some(next),
            _ => break,
        }
    }
    Ok(summaries)
}

#[async_trait]
impl RuleSetService for Wafv2Service {
    fn region(&self) -> &str {
        &self.region
    }

    async fn list(&self, scope: Scope) -> Result<Vec<IpSetSummary>, WafError> {
        let client = &self.client;
        list_pages(move |marker| async move {
            let page = client
                .list_ip_sets()
                .scope(scope.into())
                .set_next_marker(marker)
                .send()
                .await
                .map_err(service_error)?;

            let sets = page
                .ip_sets()
                .iter()
                .filter_map(|summary| match (summary.name(), summary.id()) {
                    (Some(name), Some(id)) => Some(IpSetSummary {
                        name: name.to_string(),
                        id: id.to_string(),
                    }),
                    _ => None,
                })
                .collect();
            Ok::<_, WafError>(Page {
                sets,
                next_marker: page.next_marker().map(str::to_string),
            })
        })
        .await
    }

    async fn get(&self, scope: Scope, name: &str, id: &str) -> Result<IpSetDetails, WafError> {
        let output = self
            .client
            .get_ip_set()
            .scope(scope.into())
            .name(name)
            .id(id)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(|se| se.is_waf_nonexistent_item_exception())
                {
                    WafError::NotFound {
                        name: name.to_string(),
                        scope,
                    }
                } else {
                    service_error(e)
                }
            })?;

        let ip_set = output
            .ip_set()
            .ok_or_else(|| WafError::Service(format!("GetIPSet for '{}' returned no set", name)))?;
        let lock_token = output
            .lock_token()
            .ok_or_else(|| WafError::Service(format!("GetIPSet for '{}' returned no lock token", name)))?;

        Ok(IpSetDetails {
            name: ip_set.name().to_string(),
            id: ip_set.id().to_string(),
            addresses: ip_set.addresses().to_vec(),
            family: AddressFamily::try_from(ip_set.ip_address_version())?,
            lock_token: lock_token.to_string(),
        })
    }

    async fn create(
        &self,
        scope: Scope,
        name: &str,
        family: AddressFamily,
        addresses: Vec<String>,
        description: &str,
    ) -> Result<String, WafError> {
        let output = self
            .client
            .create_ip_set()
            .scope(scope.into())
            .name(name)
            .ip_address_version(family.into())
            .set_addresses(Some(addresses))
            .description(description)
            .send()
            .await
            .map_err(service_error)?;

        output
            .summary()
            .and_then(|s| s.id())
            .map(str::to_string)
            .ok_or_else(|| WafError::Service(format!("CreateIPSet for '{}' returned no id", name)))
    }

    async fn update(
        &self,
        scope: Scope,
        name: &str,
        id: &str,
        addresses: Vec<String>,
        lock_token: &str,
    ) -> Result<(), WafError> {
        self.client
            .update_ip_set()
            .scope(scope.into())
            .name(name)
            .id(id)
            .set_addresses(Some(addresses))
            .lock_token(lock_token)
            .send()
            .await
            .map_err(|e| {
                let (stale, missing) = e.as_service_error().map_or((false, false), |se| {
                    (
                        se.is_waf_optimistic_lock_exception(),
                        se.is_waf_nonexistent_item_exception(),
                    )
                });
                if stale {
                    WafError::Conflict {
                        name: name.to_string(),
                    }
                } else if missing {
                    WafError::NotFound {
                        name: name.to_string(),
                        scope,
                    }
                } else {
                    service_error(e)
                }
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredSet {
    name: String,
    addresses: Vec<String>,
    family: AddressFamily,
    description: String,
    version: u64,
}

#[derive(Default)]
struct MemoryState {
    sets: BTreeMap<(Scope, String), StoredSet>,
    next_id: u64,
}

/// In-process firewall service for one region. Every write bumps the set's
/// version, which doubles as its lock token. Listings come back in pages of
/// `page_size` sets, chained by an offset marker.
pub struct MemoryRuleSets {
    region: String,
    state: Mutex<MemoryState>,
    page_size: usize,
    list_calls: Mutex<usize>,
}

impl MemoryRuleSets {
    pub fn new(region: &str) -> Self {
        Self::paged(region, 100)
    }

    pub fn paged(region: &str, page_size: usize) -> Self {
        MemoryRuleSets {
            region: region.to_string(),
            state: Mutex::new(MemoryState::default()),
            page_size: page_size.max(1),
            list_calls: Mutex::new(0),
        }
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    /// Seeds a set directly and returns its id.
    pub fn insert(&self, scope: Scope, name: &str, family: AddressFamily, addresses: &[&str]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{}-{:04}", self.region, state.next_id);
        state.sets.insert(
            (scope, id.clone()),
            StoredSet {
                name: name.to_string(),
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
                family,
                description: String::new(),
                version: 1,
            },
        );
        id
    }

    /// Simulates a write by some other client, invalidating handed out tokens.
    pub fn touch(&self, scope: Scope, id: &str) {
        if let Some(set) = self.state.lock().unwrap().sets.get_mut(&(scope, id.to_string())) {
            set.version += 1;
        }
    }

    pub fn addresses(&self, scope: Scope, name: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .sets
            .iter()
            .find(|((s, _), set)| *s == scope && set.name == name)
            .map(|(_, set)| set.addresses.clone())
    }

    pub fn description(&self, scope: Scope, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .sets
            .iter()
            .find(|((s, _), set)| *s == scope && set.name == name)
            .map(|(_, set)| set.description.clone())
    }

    pub fn count(&self, scope: Scope) -> usize {
        self.state
            .lock()
            .unwrap()
            .sets
            .keys()
            .filter(|(s, _)| *s == scope)
            .count()
    }
}

#[async_trait]
impl RuleSetService for MemoryRuleSets {
    fn region(&self) -> &str {
        &self.region
    }

    async fn list(&self, scope: Scope) -> Result<Vec<IpSetSummary>, WafError> {
        *self.list_calls.lock().unwrap() += 1;
        let all: Vec<IpSetSummary> = self
            .state
            .lock()
            .unwrap()
            .sets
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .map(|((_, id), set)| IpSetSummary {
                name: set.name.clone(),
                id: id.clone(),
            })
            .collect();

        list_pages(|marker| {
            let page = match marker.map(|m| m.parse::<usize>()) {
                None => Ok(0),
                Some(Ok(start)) if start <= all.len() => Ok(start),
                Some(_) => Err(WafError::Service("WAFInvalidParameterException: NextMarker".to_string())),
            }
            .map(|start| {
                let end = (start + self.page_size).min(all.len());
                Page {
                    sets: all[start..end].to_vec(),
                    next_marker: (end < all.len()).then(|| end.to_string()),
                }
            });
            futures::future::ready(page)
        })
        .await
    }

    async fn get(&self, scope: Scope, name: &str, id: &str) -> Result<IpSetDetails, WafError> {
        let state = self.state.lock().unwrap();
        match state.sets.get(&(scope, id.to_string())) {
            Some(set) if set.name == name => Ok(IpSetDetails {
                name: set.name.clone(),
                id: id.to_string(),
                addresses: set.addresses.clone(),
                family: set.family,
                lock_token: set.version.to_string(),
            }),
            _ => Err(WafError::NotFound {
                name: name.to_string(),
                scope,
            }),
        }
    }

    async fn create(
        &self,
        scope: Scope,
        name: &str,
        family: AddressFamily,
        addresses: Vec<String>,
        description: &str,
    ) -> Result<String, WafError> {
        if !is_valid_description(description) {
            return Err(WafError::Service(format!(
                "WAFInvalidParameterException: description '{}'",
                description
            )));
        }
        let mut state = self.state.lock().unwrap();
        if state.sets.iter().any(|((s, _), set)| *s == scope && set.name == name) {
            return Err(WafError::Service(format!("WAFDuplicateItemException: {}", name)));
        }
        state.next_id += 1;
        let id = format!("{}-{:04}", self.region, state.next_id);
        state.sets.insert(
            (scope, id.clone()),
            StoredSet {
                name: name.to_string(),
                addresses,
                family,
                description: description.to_string(),
                version: 1,
            },
        );
        Ok(id)
    }

    async fn update(
        &self,
        scope: Scope,
        name: &str,
        id: &str,
        addresses: Vec<String>,
        lock_token: &str,
    ) -> Result<(), WafError> {
        let mut state = self.state.lock().unwrap();
        let set = match state.sets.get_mut(&(scope, id.to_string())) {
            Some(set) if set.name == name => set,
            _ => {
                return Err(WafError::NotFound {
                    name: name.to_string(),
                    scope,
                })
            }
        };
        if set.version.to_string() != lock_token {
            return Err(WafError::Conflict {
                name: name.to_string(),
            });
        }
        set.addresses = addresses;
        set.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_service_rejects_stale_tokens() {
        let waf = MemoryRuleSets::new("eu-west-1");
        let id = waf.insert(Scope::Regional, "allow", AddressFamily::Ipv4, &["10.0.0.0/8"]);

        let read = waf.get(Scope::Regional, "allow", &id).await.unwrap();
        waf.touch(Scope::Regional, &id);

        let err = waf
            .update(Scope::Regional, "allow", &id, vec![], &read.lock_token)
            .await
            .unwrap_err();
        assert!(matches!(err, WafError::Conflict { .. }));

        let fresh = waf.get(Scope::Regional, "allow", &id).await.unwrap();
        waf.update(Scope::Regional, "allow", &id, vec![], &fresh.lock_token)
            .await
            .unwrap();
        assert_eq!(waf.addresses(Scope::Regional, "allow"), Some(vec![]));
    }

    #[tokio::test]
    async fn scopes_are_separate() {
        let waf = MemoryRuleSets::new("us-east-1");
        waf.insert(Scope::Regional, "allow", AddressFamily::Ipv4, &[]);

        assert_eq!(waf.list(Scope::Regional).await.unwrap().len(), 1);
        assert!(waf.list(Scope::Cloudfront).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_service_rejects_descriptions_the_api_would() {
        let waf = MemoryRuleSets::new("us-east-1");

        let err = waf
            .create(Scope::Regional, "a", AddressFamily::Ipv4, vec![], "Copied from a (us-east-1)")
            .await
            .unwrap_err();
        assert!(matches!(err, WafError::Service(_)));

        waf.create(Scope::Regional, "a", AddressFamily::Ipv4, vec![], "Copied from a in us-east-1")
            .await
            .unwrap();
        assert_eq!(waf.count(Scope::Regional), 1);
    }

    #[test]
    fn description_pattern_matches_the_service_model() {
        assert!(is_valid_description("Copied from allow-list in eu-west-1"));
        assert!(is_valid_description("a/b:c@d#e=f+g,h.i"));
        assert!(!is_valid_description("x"));
        assert!(!is_valid_description(" leading space"));
        assert!(!is_valid_description("has (parens)"));
        assert!(!is_valid_description(&"a".repeat(257)));
    }

    #[tokio::test]
    async fn listing_stops_on_an_empty_page_with_a_marker() {
        let mut requested = Vec::new();
        let summaries = list_pages(|marker: Option<String>| {
            requested.push(marker.clone());
            let page = match marker.as_deref() {
                None => Page {
                    sets: vec![IpSetSummary {
                        name: "a".to_string(),
                        id: "1".to_string(),
                    }],
                    next_marker: Some("p2".to_string()),
                },
                Some("p2") => Page {
                    sets: vec![IpSetSummary {
                        name: "b".to_string(),
                        id: "2".to_string(),
                    }],
                    next_marker: Some("p3".to_string()),
                },
                Some("p3") => Page {
                    sets: vec![],
                    next_marker: Some("p4".to_string()),
                },
                Some(other) => panic!("fetched past the empty page: {}", other),
            };
            futures::future::ready(Ok(page))
        })
        .await
        .unwrap();

        let names: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(
            requested,
            vec![None, Some("p2".to_string()), Some("p3".to_string())]
        );
    }

    #[tokio::test]
    async fn memory_listing_spans_pages() {
        let waf = MemoryRuleSets::paged("us-east-1", 2);
        for name in ["a", "b", "c", "d", "e"] {
            waf.insert(Scope::Regional, name, AddressFamily::Ipv4, &[]);
        }

        let listed = waf.list(Scope::Regional).await.unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(waf.list_calls(), 1);
    }

    #[test]
    fn scope_displays_as_the_api_value() {
        assert_eq!(Scope::Regional.to_string(), "REGIONAL");
        assert_eq!(Scope::Cloudfront.to_string(), "CLOUDFRONT");
    }
}
