// =============================================================================
// Telemetry Client — per-machine OPC UA polling
// =============================================================================
//
// One client per machine, running a blocking poll loop on the runtime's
// blocking pool (the OPC UA client is synchronous). The loop never gives
// up: connection failures retry after one poll interval, read failures tear
// the session down and reconnect, and every tick checks the process-wide
// cancellation token.
//
// A tick reads every configured variable in one batched OPC UA read.
// Variables with a bad status are logged and omitted; a tick in which
// nothing at all could be read is treated as a dead connection.
// =============================================================================

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{Timelike, Utc};
use opcua::client::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::config::{Credentials, MachineFamily};
use crate::normalizer;
use crate::types::{RawValue, StatusRecord};

type SharedSession = Arc<opcua::sync::RwLock<Session>>;

/// Polls one machine's OPC UA endpoint and publishes normalized samples
/// into the shared registers.
pub struct TelemetryClient {
    machine_name: String,
    family: MachineFamily,
    endpoint_url: String,
    credentials: Credentials,
    /// `(logical name, node id)` pairs, pre-parsed at construction.
    nodes: Vec<(String, NodeId)>,
    poll_interval: std::time::Duration,
}

impl TelemetryClient {
    pub fn new(
        machine_name: String,
        family: MachineFamily,
        endpoint_url: String,
        credentials: Credentials,
        variables: &BTreeMap<String, String>,
        poll_interval: std::time::Duration,
    ) -> Self {
        let mut nodes = Vec::with_capacity(variables.len());
        for (name, node_id) in variables {
            match NodeId::from_str(node_id) {
                Ok(parsed) => nodes.push((name.clone(), parsed)),
                Err(_) => warn!(
                    machine = %machine_name,
                    variable = %name,
                    node_id = %node_id,
                    "invalid node id in configuration, variable will not be polled"
                ),
            }
        }

        Self {
            machine_name,
            family,
            endpoint_url,
            credentials,
            nodes,
            poll_interval,
        }
    }

    /// Blocking run loop; returns only once `token` is cancelled.
    pub fn run(&self, state: Arc<AppState>, token: CancellationToken) {
        info!(
            machine = %self.machine_name,
            url = %self.endpoint_url,
            variables = self.nodes.len(),
            "telemetry client started"
        );

        while !token.is_cancelled() {
            let session = match self.connect() {
                Ok(session) => session,
                Err(e) => {
                    error!(
                        machine = %self.machine_name,
                        url = %self.endpoint_url,
                        error = %e,
                        "connection failed, retrying"
                    );
                    self.wait_tick(&token);
                    continue;
                }
            };

            info!(machine = %self.machine_name, "connected to OPC UA server");
            self.poll_until_fault(&session, &state, &token);

            // Socket-teardown errors during disconnect are expected when
            // the server side already dropped us.
            session.write().disconnect();
            info!(machine = %self.machine_name, "disconnected from OPC UA server");
        }

        info!(machine = %self.machine_name, "telemetry client stopped");
    }

    fn connect(&self) -> Result<SharedSession> {
        let mut client: Client = ClientBuilder::new()
            .application_name("shopfloor-watch")
            .application_uri("urn:shopfloor-watch")
            .product_uri("urn:shopfloor-watch")
            .trust_server_certs(true)
            .create_sample_keypair(true)
            .session_retry_limit(3)
            .client()
            .ok_or_else(|| anyhow!("invalid OPC UA client configuration"))?;

        let endpoint: EndpointDescription = (
            self.endpoint_url.as_str(),
            SecurityPolicy::None.to_str(),
            MessageSecurityMode::None,
            UserTokenPolicy::anonymous(),
        )
            .into();

        let identity = IdentityToken::UserName(
            self.credentials.user.clone(),
            self.credentials.password.clone(),
        );

        client
            .connect_to_endpoint(endpoint, identity)
            .map_err(|status| anyhow!("OPC UA connect failed: {status}"))
    }

    /// Poll until cancellation or a connection-level fault; the caller
    /// disconnects and reconnects.
    fn poll_until_fault(
        &self,
        session: &SharedSession,
        state: &Arc<AppState>,
        token: &CancellationToken,
    ) {
        while !token.is_cancelled() {
            match self.read_all(session) {
                Ok(raw) if raw.is_empty() => {
                    warn!(
                        machine = %self.machine_name,
                        "no variables could be read, forcing reconnect"
                    );
                    return;
                }
                Ok(raw) => self.publish(state, raw),
                Err(e) => {
                    error!(
                        machine = %self.machine_name,
                        error = %e,
                        "read failed, forcing reconnect"
                    );
                    return;
                }
            }

            self.wait_tick(token);
        }
    }

    /// Read every configured variable in one batched request. Bad
    /// per-variable statuses are warnings; a failed request is a
    /// connection-level fault.
    fn read_all(&self, session: &SharedSession) -> Result<BTreeMap<String, RawValue>> {
        if self.nodes.is_empty() {
            return Ok(BTreeMap::new());
        }

        let read_ids: Vec<ReadValueId> = self
            .nodes
            .iter()
            .map(|(_, node_id)| ReadValueId::from(node_id.clone()))
            .collect();

        let results = {
            let session = session.read();
            session
                .read(&read_ids, TimestampsToReturn::Neither, 0.0)
                .map_err(|status| anyhow!("OPC UA read failed: {status}"))?
        };

        let mut raw = BTreeMap::new();
        for ((name, node_id), data_value) in self.nodes.iter().zip(results) {
            match extract_value(&data_value) {
                Some(value) => {
                    raw.insert(name.clone(), value);
                }
                None => warn!(
                    machine = %self.machine_name,
                    variable = %name,
                    node_id = %node_id,
                    status = ?data_value.status,
                    "variable could not be read"
                ),
            }
        }
        Ok(raw)
    }

    fn publish(&self, state: &Arc<AppState>, raw: BTreeMap<String, RawValue>) {
        // Second precision: the status log dedupes on this timestamp.
        let now = Utc::now();
        let now = now.with_nanosecond(0).unwrap_or(now);

        let machine_state = normalizer::normalize(&self.machine_name, self.family, &raw, now);

        let record = StatusRecord {
            timestamp: now,
            status_text: machine_state.status_text.clone(),
            spindle_speed: machine_state.spindle_speed,
            feed_rate: machine_state.feed_rate,
            current_program: machine_state.current_program.clone(),
            raw: serde_json::to_value(&raw).unwrap_or(serde_json::Value::Null),
        };

        state.publish_sample(&self.machine_name, machine_state, record);
    }

    fn wait_tick(&self, token: &CancellationToken) {
        let step = std::time::Duration::from_millis(200);
        let mut remaining = self.poll_interval;
        while !remaining.is_zero() && !token.is_cancelled() {
            let chunk = remaining.min(step);
            std::thread::sleep(chunk);
            remaining -= chunk;
        }
    }
}

/// Pull a usable value out of one read result; `None` when the status is
/// bad or the value is absent.
fn extract_value(data_value: &DataValue) -> Option<RawValue> {
    if let Some(status) = data_value.status {
        if !status.is_good() {
            return None;
        }
    }
    data_value.value.as_ref().map(variant_to_raw)
}

/// Flatten an OPC UA variant into the closed [`RawValue`] set the
/// normalizer understands.
fn variant_to_raw(variant: &Variant) -> RawValue {
    match variant {
        Variant::Boolean(b) => RawValue::Bool(*b),
        Variant::SByte(v) => RawValue::Int(i64::from(*v)),
        Variant::Byte(v) => RawValue::Int(i64::from(*v)),
        Variant::Int16(v) => RawValue::Int(i64::from(*v)),
        Variant::UInt16(v) => RawValue::Int(i64::from(*v)),
        Variant::Int32(v) => RawValue::Int(i64::from(*v)),
        Variant::UInt32(v) => RawValue::Int(i64::from(*v)),
        Variant::Int64(v) => RawValue::Int(*v),
        Variant::UInt64(v) => RawValue::Int(*v as i64),
        Variant::Float(v) => RawValue::Float(f64::from(*v)),
        Variant::Double(v) => RawValue::Float(*v),
        Variant::String(s) => RawValue::Text(s.to_string()),
        other => RawValue::Text(format!("{other:?}")),
    }
}
