//! Copies WAF IP sets between regions and scopes.
//!
//! The destination side is a small state machine. A set starts out `Absent`
//! or `Present`; `create` moves Absent to Present, a read right before the
//! write yields a `Locked` set holding the current lock token, and the update
//! under that token either lands or ends in [`WafError::Conflict`], which the
//! caller resolves by running again.

use crate::waf::{IpSetDetails, RuleSetService, Scope, WafError};

/// Finds the first set in `scope` whose name matches exactly.
pub async fn find_by_name(
    service: &dyn RuleSetService,
    scope: Scope,
    name: &str,
) -> Result<Option<IpSetDetails>, WafError> {
    match find_id(service, scope, name).await? {
        Some(id) => service.get(scope, name, &id).await.map(Some),
        None => Ok(None),
    }
}

async fn find_id(
    service: &dyn RuleSetService,
    scope: Scope,
    name: &str,
) -> Result<Option<String>, WafError> {
    let summaries = service.list(scope).await?;
    Ok(summaries.into_iter().find(|s| s.name == name).map(|s| s.id))
}

/// A side of a replication: the service for a region plus the scope in it.
#[derive(Clone, Copy)]
pub struct Endpoint<'a> {
    pub service: &'a dyn RuleSetService,
    pub scope: Scope,
}

impl<'a> Endpoint<'a> {
    pub fn new(service: &'a dyn RuleSetService, scope: Scope) -> Self {
        if scope == Scope::Cloudfront && service.region() != "us-east-1" {
            log::warn!(
                "CLOUDFRONT IP sets live in us-east-1, not {}",
                service.region()
            );
        }
        Endpoint { service, scope }
    }
}

/// What happened to the destination set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    Absent,
    Present { id: String },
}

/// A destination set together with the token its next update must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Locked {
    id: String,
    lock_token: String,
}

/// Makes the destination set's addresses equal to the source set's.
pub async fn replicate(
    source: Endpoint<'_>,
    source_name: &str,
    destination: Endpoint<'_>,
    destination_name: &str,
) -> Result<Outcome, WafError> {
    let source_set = find_by_name(source.service, source.scope, source_name)
        .await?
        .ok_or_else(|| WafError::NotFound {
            name: source_name.to_string(),
            scope: source.scope,
        })?;
    copy_set(source, source_set, destination, destination_name).await
}

async fn copy_set(
    source: Endpoint<'_>,
    source_set: IpSetDetails,
    destination: Endpoint<'_>,
    destination_name: &str,
) -> Result<Outcome, WafError> {
    log::debug!(
        "source '{}' in {} has {} addresses",
        source_set.name,
        source.service.region(),
        source_set.addresses.len()
    );

    let state = match find_id(destination.service, destination.scope, destination_name).await? {
        None => Destination::Absent,
        Some(id) => Destination::Present { id },
    };

    let (outcome, id) = match state {
        Destination::Absent => {
            let description = format!(
                "Copied from {} in {}",
                source_set.name,
                source.service.region()
            );
            let id = destination
                .service
                .create(
                    destination.scope,
                    destination_name,
                    source_set.family,
                    Vec::new(),
                    &description,
                )
                .await?;
            log::info!(
                "created IP set '{}' in {} ({})",
                destination_name,
                destination.service.region(),
                destination.scope
            );
            (Outcome::Created, id)
        }
        Destination::Present { id } => (Outcome::Updated, id),
    };

    let locked = lock(destination, destination_name, &id).await?;
    destination
        .service
        .update(
            destination.scope,
            destination_name,
            &locked.id,
            source_set.addresses,
            &locked.lock_token,
        )
        .await?;

    log::info!(
        "IP set '{}' copied from {} to {} as '{}'",
        source_set.name,
        source.service.region(),
        destination.service.region(),
        destination_name
    );
    Ok(outcome)
}

/// Reads the destination for its current lock token.
async fn lock(destination: Endpoint<'_>, name: &str, id: &str) -> Result<Locked, WafError> {
    let current = destination.service.get(destination.scope, name, id).await?;
    Ok(Locked {
        id: current.id,
        lock_token: current.lock_token,
    })
}

/// Per-set results of [`replicate_all`], in source listing order.
#[derive(Debug, Default)]
pub struct ReplicationSummary {
    pub results: Vec<(String, Result<Outcome, WafError>)>,
}

impl ReplicationSummary {
    pub fn failures(&self) -> impl Iterator<Item = (&str, &WafError)> {
        self.results
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }
}

/// Replicates every set in the source scope under its own name. The source
/// is listed once; a failing set is recorded and the rest still run.
pub async fn replicate_all(
    source: Endpoint<'_>,
    destination: Endpoint<'_>,
) -> Result<ReplicationSummary, WafError> {
    let mut summary = ReplicationSummary::default();
    for set in source.service.list(source.scope).await? {
        let result = match source.service.get(source.scope, &set.name, &set.id).await {
            Ok(source_set) => copy_set(source, source_set, destination, &set.name).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log::error!("IP set '{}' not copied: {}", set.name, e);
        }
        summary.results.push((set.name, result));
    }
    Ok(summary)
}
