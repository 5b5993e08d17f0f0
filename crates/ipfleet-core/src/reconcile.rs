//! DNS set reconciliation
//!
//! Makes the records matching one (label, type) pair equal a desired IP set.
//! Records are matched by value, never by provider id, so a pass can start
//! from any record set and repeating it with the same input is a no-op.

use crate::config::{RecordType, RoutingLines};
use crate::error::{Error, Result};
use crate::fleet::DesiredIpSet;
use crate::traits::{DnsProvider, DnsRecord, NewDnsRecord};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one `ensure_exact_set` pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// IPs for which a record was created
    pub added: Vec<IpAddr>,
    /// Values of deleted records
    pub deleted: Vec<String>,
    /// Records that already matched
    pub unchanged: usize,
    /// Mutations that failed; retried on the next pass
    pub failures: Vec<String>,
}

impl ReconcileReport {
    /// Whether the pass issued no add or delete
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.failures.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives a [`DnsProvider`] towards a desired record set
pub struct DnsReconciler {
    provider: Arc<dyn DnsProvider>,
    ttl: u32,
    lines: RoutingLines,
}

impl std::fmt::Debug for DnsReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsReconciler")
            .field("provider", &self.provider.provider_name())
            .field("ttl", &self.ttl)
            .field("lines", &self.lines)
            .finish()
    }
}

impl DnsReconciler {
    pub fn new(provider: Arc<dyn DnsProvider>, ttl: u32, lines: RoutingLines) -> Self {
        if !provider.supports_routing_lines() && !lines.by_region.is_empty() {
            warn!(
                provider = provider.provider_name(),
                "DNS provider has no routing lines, region mapping ignored"
            );
        }
        Self {
            provider,
            ttl,
            lines,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    /// Current records for `label` of `record_type` under `domain`
    pub async fn list_matching(
        &self,
        domain: &str,
        label: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsRecord>> {
        let records = self.provider.list_records(domain).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.matches(label, record_type))
            .collect())
    }

    /// Make the matching records equal `desired`.
    ///
    /// Stale and duplicate records are deleted first, then missing IPs are
    /// added with the configured TTL and the routing line of the region they
    /// came from. A delete of a missing record and an add of an existing one
    /// count as done. Other mutation failures are collected in the report and
    /// the pass continues; only a failed listing aborts it.
    pub async fn ensure_exact_set(
        &self,
        domain: &str,
        label: &str,
        record_type: RecordType,
        desired: &DesiredIpSet,
    ) -> Result<ReconcileReport> {
        let current = self.list_matching(domain, label, record_type).await?;
        let mut report = ReconcileReport::default();

        let mut wanted = BTreeSet::new();
        for ip in desired.ips() {
            if record_type.accepts(ip) {
                wanted.insert(*ip);
            } else {
                warn!(%ip, record_type = %record_type, "address family does not match record type, skipping");
            }
        }

        let mut present = BTreeSet::new();
        for record in &current {
            match record.ip() {
                Some(ip) if wanted.contains(&ip) && present.insert(ip) => {
                    report.unchanged += 1;
                }
                _ => self.delete(domain, record, &mut report).await,
            }
        }

        for ip in wanted.difference(&present) {
            let record = NewDnsRecord {
                label: label.to_string(),
                record_type,
                value: *ip,
                ttl: self.ttl,
                line: self.line_for(desired.region_of(ip)).to_string(),
            };
            self.add(domain, record, &mut report).await;
        }

        if report.is_noop() {
            debug!(domain, label, records = report.unchanged, "DNS record set already in sync");
        } else {
            info!(
                domain,
                label,
                added = report.added.len(),
                deleted = report.deleted.len(),
                unchanged = report.unchanged,
                failures = report.failures.len(),
                "DNS record set reconciled"
            );
        }

        Ok(report)
    }

    /// Routing line for an IP's region; the default line when the provider
    /// cannot route by line
    fn line_for(&self, region: Option<&str>) -> &str {
        if self.provider.supports_routing_lines() {
            self.lines.line_for(region)
        } else {
            &self.lines.default_line
        }
    }

    async fn delete(&self, domain: &str, record: &DnsRecord, report: &mut ReconcileReport) {
        match self.provider.delete_record(domain, &record.id).await {
            Ok(()) => {
                info!(domain, label = %record.label, value = %record.value, id = %record.id, "deleted DNS record");
                report.deleted.push(record.value.clone());
            }
            Err(e) if e.is_already_satisfied() => {
                debug!(value = %record.value, id = %record.id, reason = %e, "record already gone");
                report.deleted.push(record.value.clone());
            }
            Err(e) => {
                warn!(
                    provider = self.provider.provider_name(),
                    value = %record.value,
                    id = %record.id,
                    error = %e,
                    "failed to delete DNS record"
                );
                report
                    .failures
                    .push(format!("delete {} ({}): {}", record.value, record.id, e));
            }
        }
    }

    async fn add(&self, domain: &str, record: NewDnsRecord, report: &mut ReconcileReport) {
        match self.provider.add_record(domain, &record).await {
            Ok(()) => {
                info!(
                    domain,
                    label = %record.label,
                    value = %record.value,
                    line = %record.line,
                    ttl = record.ttl,
                    "added DNS record"
                );
                report.added.push(record.value);
            }
            // A missing zone on create is a real failure, only a duplicate counts as done
            Err(e @ Error::Conflict(_)) => {
                debug!(value = %record.value, reason = %e, "record already present");
                report.unchanged += 1;
            }
            Err(e) => {
                warn!(
                    provider = self.provider.provider_name(),
                    value = %record.value,
                    error = %e,
                    "failed to add DNS record"
                );
                report.failures.push(format!("add {}: {}", record.value, e));
            }
        }
    }
}
