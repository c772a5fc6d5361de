//! Subscriptions: compiled queries re-run on a poll loop, streaming changes.
//!
//! Subscribers are multiplexed onto topics keyed by a fingerprint of
//! `(query, role, variables)`. Each topic runs exactly one polling task;
//! topic creation is a check-then-insert under one lock, so a fingerprint
//! never gets two loops. A topic holds no database connection between ticks
//! and dies when its last subscriber goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::engine::{Context, Core, QueryComp, ReqConfig, Response};
use crate::parser::ast::OpKind;
use crate::{Error, Result};

/// Outstanding messages per subscriber before it is considered lagged.
const MEMBER_BUFFER: usize = 64;

/// Poll-interval floor; configured values below this are clamped.
const MIN_POLL_MS: u64 = 500;
const DEFAULT_POLL_MS: u64 = 1000;

#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Response>,
}

impl Subscription {
    /// The next observed change; `None` once the topic disconnects this
    /// subscriber (lag) or shuts down.
    pub async fn recv(&mut self) -> Option<Response> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<Response> {
        ReceiverStream::new(self.rx)
    }
}

struct NewMember {
    tx: mpsc::Sender<Response>,
}

pub(crate) struct SubHub {
    topics: Mutex<HashMap<String, mpsc::UnboundedSender<NewMember>>>,
}

impl SubHub {
    pub(crate) fn new() -> SubHub {
        SubHub {
            topics: Mutex::new(HashMap::new()),
        }
    }
}

pub(crate) async fn subscribe(
    core: Arc<Core>,
    ctx: &Context,
    query: &str,
    vars: Option<serde_json::Value>,
    _rc: Option<ReqConfig>,
) -> Result<Subscription> {
    let (op, name) = crate::parser::operation(query);
    if op != OpKind::Subscription {
        return Err(Error::UnsupportedOperation(
            "use graphql() for queries and mutations".into(),
        ));
    }

    let role = core.resolve_role(ctx, None).await?;
    let comp = core.resolve_comp(op, name, query, vars.as_ref(), &role)?;
    let fingerprint = fingerprint(query, &role, vars.as_ref());

    let (tx, rx) = mpsc::channel(MEMBER_BUFFER);

    // Check-then-insert under the lock keeps one loop per fingerprint; a
    // dead sender (loop already exiting) is replaced in place.
    {
        let mut topics = core.subs.topics.lock().expect("subs lock");
        let registered = topics
            .get(&fingerprint)
            .map(|reg| reg.send(NewMember { tx: tx.clone() }).is_ok())
            .unwrap_or(false);

        if !registered {
            let (reg_tx, reg_rx) = mpsc::unbounded_channel();
            reg_tx
                .send(NewMember { tx })
                .expect("receiver held on this stack");
            topics.insert(fingerprint.clone(), reg_tx);

            let topic = Topic {
                core: core.clone(),
                comp,
                ctx: ctx.clone(),
                vars,
                name: name.to_string(),
                role,
                fingerprint: fingerprint.clone(),
            };
            tokio::spawn(topic.run(reg_rx));
        }
    }

    Ok(Subscription { rx })
}

/// Stable identity of a polling loop.
fn fingerprint(query: &str, role: &str, vars: Option<&serde_json::Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0]);
    hasher.update(role.as_bytes());
    hasher.update([0]);
    if let Some(vars) = vars {
        hasher.update(vars.to_string().as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

struct Topic {
    core: Arc<Core>,
    comp: Arc<QueryComp>,
    ctx: Context,
    vars: Option<serde_json::Value>,
    name: String,
    role: String,
    fingerprint: String,
}

impl Topic {
    async fn run(self, mut reg_rx: mpsc::UnboundedReceiver<NewMember>) {
        let poll_ms = self
            .core
            .conf
            .subs_poll_ms
            .unwrap_or(DEFAULT_POLL_MS)
            .max(MIN_POLL_MS);
        let mut interval = tokio::time::interval(Duration::from_millis(poll_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut members: Vec<mpsc::Sender<Response>> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut last_data: Option<String> = None;

        loop {
            tokio::select! {
                // Registrations drain before a tick fires, so a subscriber
                // arriving between ticks never misses the next emission.
                biased;
                member = reg_rx.recv() => {
                    if let Some(m) = member {
                        members.push(m.tx);
                    }
                }
                _ = interval.tick() => {
                    match self.tick(cursor.as_deref(), last_data.as_deref()).await {
                        Ok(Some(emission)) => {
                            if let Some(next) = emission.cursor {
                                cursor = Some(next);
                            }
                            last_data = Some(emission.raw);
                            let resp = emission.response;
                            members.retain(|tx| match tx.try_send(resp.clone()) {
                                Ok(()) => true,
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!(
                                        fingerprint = %self.fingerprint,
                                        "{}", Error::SubscriberLagged
                                    );
                                    false
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => false,
                            });
                        }
                        Ok(None) => {}
                        Err(err) => {
                            debug!(fingerprint = %self.fingerprint, %err, "poll failed");
                        }
                    }

                    members.retain(|tx| !tx.is_closed());
                    if members.is_empty() && self.teardown(&mut reg_rx, &mut members) {
                        break;
                    }
                }
            }
        }
    }

    /// Tear the topic down unless someone registered since the last poll.
    /// Registration and removal contend on the same lock, so a subscriber
    /// either lands in the queue we drain here or finds the topic gone and
    /// spins up a fresh one.
    fn teardown(
        &self,
        reg_rx: &mut mpsc::UnboundedReceiver<NewMember>,
        members: &mut Vec<mpsc::Sender<Response>>,
    ) -> bool {
        let mut topics = self.core.subs.topics.lock().expect("subs lock");
        while let Ok(m) = reg_rx.try_recv() {
            members.push(m.tx);
        }
        if members.is_empty() {
            topics.remove(&self.fingerprint);
            true
        } else {
            false
        }
    }

    async fn tick(&self, cursor: Option<&str>, last_data: Option<&str>) -> Result<Option<Emission>> {
        let args = self
            .core
            .bind_args(&self.comp, &self.ctx, self.vars.as_ref(), None, cursor)?;

        let mut conn = self.core.pool.acquire().await?;
        let rows = conn.query(&self.comp.sql, &args).await?;
        drop(conn);

        let Some(bytes) = rows.first_value() else {
            return Ok(None);
        };
        let raw = String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Execution(format!("non-utf8 result: {e}")))?;

        match &self.comp.md.cursor_field {
            Some(field) => {
                let mut doc: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| Error::Execution(format!("malformed result: {e}")))?;

                // An empty page means no rows past the cursor.
                let root_field = &self.comp.qcode.selects[0].field_name;
                if doc
                    .get(root_field)
                    .and_then(|v| v.as_array())
                    .map(|a| a.is_empty())
                    .unwrap_or(true)
                {
                    return Ok(None);
                }

                let next = doc
                    .get(field)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                if let Some(obj) = doc.as_object_mut() {
                    let token = next
                        .as_deref()
                        .map(|raw| self.core.cursor.encode(raw))
                        .map(serde_json::Value::String)
                        .unwrap_or(serde_json::Value::Null);
                    obj.insert(field.clone(), token);
                }

                let rendered = doc.to_string();
                Ok(Some(Emission {
                    response: self.response(&rendered),
                    cursor: next,
                    raw,
                }))
            }
            None => {
                if last_data == Some(raw.as_str()) {
                    return Ok(None);
                }
                Ok(Some(Emission {
                    response: self.response(&raw),
                    cursor: None,
                    raw,
                }))
            }
        }
    }

    fn response(&self, data: &str) -> Response {
        let mut resp = Response::new(OpKind::Subscription, &self.name);
        resp.data = serde_json::value::RawValue::from_string(data.to_string()).ok();
        resp.set_execution_facts(&self.comp.sql, &self.role, None);
        resp
    }
}

struct Emission {
    response: Response,
    /// Internal (unsigned) cursor for the next tick's binding.
    cursor: Option<String>,
    raw: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let q = "subscription { chats { id } }";
        let a = fingerprint(q, "user", Some(&serde_json::json!({ "id": 1 })));
        let b = fingerprint(q, "user", Some(&serde_json::json!({ "id": 1 })));
        let c = fingerprint(q, "anon", Some(&serde_json::json!({ "id": 1 })));
        let d = fingerprint(q, "user", Some(&serde_json::json!({ "id": 2 })));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }
}
