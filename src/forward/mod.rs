// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The forwarding handler: relays queries to an ordered list of primary
//! upstreams, falling through to fallback upstreams when none of the
//! currently-healthy primaries answers. Health is maintained by
//! [`ForwardHandler::refresh`] (see [`healthcheck`]).

pub mod healthcheck;

use crate::{
    context::QueryContext,
    handler::{self, Handler, ResponseWriter},
    metrics::{EmptyMetricsListener, MetricsListener},
    upstream::{Upstream, UpstreamError},
};
use async_trait::async_trait;
use log::debug;
use std::{
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::time::timeout;
use trust_dns_proto::{error::ProtoError, op::Message};

/// Error produced by the forwarding handler.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Every tried upstream failed. Records the last main and fallback that
    /// were attempted, with the last failure as the source.
    #[error("forwarding failed (main: {main}, fallback: {})", .fallback.as_deref().unwrap_or("none"))]
    Exchange {
        /// The last primary upstream that was tried, or "none" when every
        /// primary was in backoff.
        main: String,
        /// The last fallback upstream that was tried, if any.
        fallback: Option<String>,
        /// The most recent failure.
        #[source]
        cause: UpstreamError,
    },

    /// A refresh found every primary upstream failing its healthcheck.
    #[error("all main upstreams are down: {0}")]
    AllDown(String),

    /// The handler was built without any primary upstream.
    #[error("at least one main upstream is required")]
    NoMainUpstreams,

    /// The healthcheck domain template does not form a valid name.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Tunables for [`ForwardHandler`].
#[derive(Clone)]
pub struct ForwardOpts {
    /// How long a primary that failed its healthcheck stays excluded.
    pub backoff: Duration,
    /// Domain the healthcheck probes for. A literal `${RANDOM}` is replaced
    /// with a fresh 64-bit hex string on every probe.
    pub probe_domain: String,
    /// Per-exchange timeout, for both queries and probes.
    pub timeout: Duration,
}

impl Default for ForwardOpts {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(60),
            probe_domain: "${RANDOM}.example.org.".to_string(),
            timeout: Duration::from_secs(1),
        }
    }
}

/// A [`Handler`] that answers by relaying to external resolvers.
pub struct ForwardHandler {
    mains: Vec<Arc<dyn Upstream>>,
    fallbacks: Vec<Arc<dyn Upstream>>,
    // Index-aligned with `mains`; None means "considered up".
    last_failed: Mutex<Vec<Option<Instant>>>,
    // Indices into `mains` that passed the last refresh. Queries snapshot
    // this under the read lock; refresh swaps it under the write lock.
    active: RwLock<Vec<usize>>,
    backoff: Duration,
    probe_domain: String,
    timeout: Duration,
    metrics: Arc<dyn MetricsListener>,
}

impl ForwardHandler {
    /// Create a forwarding handler. `mains` must not be empty; `fallbacks`
    /// may be.
    pub fn new(
        mains: Vec<Arc<dyn Upstream>>,
        fallbacks: Vec<Arc<dyn Upstream>>,
        opts: ForwardOpts,
    ) -> Result<Self, ForwardError> {
        if mains.is_empty() {
            return Err(ForwardError::NoMainUpstreams);
        }
        let all: Vec<usize> = (0..mains.len()).collect();
        let len = mains.len();
        Ok(Self {
            mains,
            fallbacks,
            last_failed: Mutex::new(vec![None; len]),
            active: RwLock::new(all),
            backoff: opts.backoff,
            probe_domain: opts.probe_domain,
            timeout: opts.timeout,
            metrics: Arc::new(EmptyMetricsListener),
        })
    }

    /// Replace the metrics listener.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsListener>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The primaries currently passing healthchecks, for inspection.
    pub fn active_upstreams(&self) -> Vec<Arc<dyn Upstream>> {
        self.active
            .read()
            .expect("active set poisoned")
            .iter()
            .map(|&i| self.mains[i].clone())
            .collect()
    }

    async fn try_one(&self, u: &Arc<dyn Upstream>, req: &Message) -> Result<Message, UpstreamError> {
        let started = Instant::now();
        let result = match timeout(self.timeout, u.exchange(req)).await {
            Ok(r) => r,
            Err(elapsed) => Err(UpstreamError::wrap(u.to_string(), elapsed.into())),
        };
        self.metrics
            .on_forward_request(&u.to_string(), started.elapsed(), result.as_ref().err());
        result
    }

    /// Relay `req`: active primaries in order, then fallbacks in order,
    /// returning the first successful exchange.
    pub async fn exchange(&self, req: &Message) -> Result<Message, ForwardError> {
        let active: Vec<usize> = self.active.read().expect("active set poisoned").clone();

        let mut last_main: Option<(String, UpstreamError)> = None;
        for &i in &active {
            let u = &self.mains[i];
            match self.try_one(u, req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!("main upstream {} failed: {}", u, e);
                    last_main = Some((u.to_string(), e));
                }
            }
        }

        let mut last_fallback: Option<(String, UpstreamError)> = None;
        for u in &self.fallbacks {
            match self.try_one(u, req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!("fallback upstream {} failed: {}", u, e);
                    last_fallback = Some((u.to_string(), e));
                }
            }
        }

        let main = last_main
            .as_ref()
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "none".to_string());
        let (fallback, cause) = match (last_fallback, last_main) {
            (Some((name, cause)), _) => (Some(name), cause),
            (None, Some((_, cause))) => (None, cause),
            (None, None) => (
                None,
                UpstreamError::Invalid("no upstream was eligible for the query"),
            ),
        };
        Err(ForwardError::Exchange {
            main,
            fallback,
            cause,
        })
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn serve_dns(
        &self,
        cx: &QueryContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
    ) -> handler::Result<()> {
        let mut resp = self.exchange(req).await?;
        resp.set_id(req.id());
        rw.write_msg(cx, req, resp).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        fmt,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use trust_dns_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use trust_dns_proto::rr::{Name, RecordType};

    /// Scripted upstream: answers with the given rcode, or errors out when
    /// the rcode is `None`. The script can be changed mid-test.
    pub(crate) struct ScriptedUpstream {
        pub name: &'static str,
        pub rcode: Mutex<Option<ResponseCode>>,
        pub hits: AtomicUsize,
    }

    impl ScriptedUpstream {
        pub fn new(name: &'static str, rcode: Option<ResponseCode>) -> Arc<Self> {
            Arc::new(Self {
                name,
                rcode: Mutex::new(rcode),
                hits: AtomicUsize::new(0),
            })
        }

        pub fn set_rcode(&self, rcode: Option<ResponseCode>) {
            *self.rcode.lock().unwrap() = rcode;
        }
    }

    impl fmt::Display for ScriptedUpstream {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name)
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn exchange(&self, req: &Message) -> crate::upstream::Result<Message> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            match *self.rcode.lock().unwrap() {
                Some(rcode) => {
                    let mut resp = Message::new();
                    resp.set_id(req.id())
                        .set_message_type(MessageType::Response)
                        .set_response_code(rcode);
                    for q in req.queries() {
                        resp.add_query(q.clone());
                    }
                    Ok(resp)
                }
                None => Err(UpstreamError::Invalid("scripted failure")),
            }
        }
    }

    pub(crate) fn probe_req() -> Message {
        let mut msg = Message::new();
        msg.set_id(77)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .add_query(Query::query(
                Name::from_utf8("example.org.").unwrap(),
                RecordType::A,
            ));
        msg
    }

    #[tokio::test]
    async fn first_healthy_main_wins() {
        let a = ScriptedUpstream::new("a", Some(ResponseCode::NoError));
        let b = ScriptedUpstream::new("b", Some(ResponseCode::NoError));
        let h = ForwardHandler::new(
            vec![a.clone(), b.clone()],
            vec![],
            ForwardOpts::default(),
        )
        .unwrap();

        h.exchange(&probe_req()).await.unwrap();
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_main_falls_through_in_order() {
        let a = ScriptedUpstream::new("a", None);
        let b = ScriptedUpstream::new("b", Some(ResponseCode::NoError));
        let h = ForwardHandler::new(
            vec![a.clone(), b.clone()],
            vec![],
            ForwardOpts::default(),
        )
        .unwrap();

        h.exchange(&probe_req()).await.unwrap();
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(b.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallbacks_run_after_all_mains() {
        let a = ScriptedUpstream::new("a", None);
        let fb = ScriptedUpstream::new("fb", Some(ResponseCode::NoError));
        let h = ForwardHandler::new(vec![a.clone()], vec![fb.clone()], ForwardOpts::default())
            .unwrap();

        h.exchange(&probe_req()).await.unwrap();
        assert_eq!(a.hits.load(Ordering::SeqCst), 1);
        assert_eq!(fb.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn total_failure_reports_both_sides() {
        let a = ScriptedUpstream::new("a", None);
        let fb = ScriptedUpstream::new("fb", None);
        let h = ForwardHandler::new(vec![a], vec![fb], ForwardOpts::default()).unwrap();

        match h.exchange(&probe_req()).await {
            Err(ForwardError::Exchange { main, fallback, .. }) => {
                assert_eq!(main, "a");
                assert_eq!(fallback.as_deref(), Some("fb"));
            }
            other => panic!("expected exchange error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn empty_main_list_is_rejected() {
        assert!(matches!(
            ForwardHandler::new(vec![], vec![], ForwardOpts::default()),
            Err(ForwardError::NoMainUpstreams)
        ));
    }
}
