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

//! Healthchecks for the forwarding handler. [`ForwardHandler::refresh`]
//! probes each primary upstream that is not inside its backoff window and
//! rebuilds the active set from the ones that answered NoError.

use super::{ForwardError, ForwardHandler};
use log::{debug, info, warn};
use rand::Rng;
use std::time::Instant;
use tokio::time::timeout;
use trust_dns_proto::{
    error::ProtoError,
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, RecordType},
};

impl ForwardHandler {
    /// Probe the primary upstreams and swap in a fresh active set.
    ///
    /// Primaries that failed less than the backoff ago are skipped and stay
    /// excluded. With no fallbacks configured this is a no-op: there is
    /// nowhere to fail over to, so every primary stays eligible. Returns
    /// [`ForwardError::AllDown`] when the refresh leaves the active set
    /// empty.
    pub async fn refresh(&self) -> Result<(), ForwardError> {
        if self.fallbacks.is_empty() {
            return Ok(());
        }

        let mut fresh = Vec::with_capacity(self.mains.len());
        let mut errs = Vec::new();

        for (i, u) in self.mains.iter().enumerate() {
            let failed_at = self.last_failed.lock().expect("status poisoned")[i];
            if let Some(at) = failed_at {
                if at.elapsed() < self.backoff {
                    debug!("skipping healthcheck for {}: still in backoff", u);
                    continue;
                }
            }

            let probe = probe_query(&self.probe_domain)?;
            let verdict = match timeout(self.timeout, u.exchange(&probe)).await {
                Ok(Ok(resp)) if resp.response_code() == ResponseCode::NoError => Ok(()),
                Ok(Ok(resp)) => Err(format!("{}: healthcheck answered {}", u, resp.response_code())),
                Ok(Err(e)) => Err(format!("{}: {}", u, e)),
                Err(e) => Err(format!("{}: {}", u, e)),
            };

            let mut status = self.last_failed.lock().expect("status poisoned");
            match verdict {
                Ok(()) => {
                    if status[i].is_some() {
                        info!("upstream {} passed its healthcheck and is back up", u);
                        self.metrics
                            .on_upstream_status_changed(&u.to_string(), true, true);
                    }
                    status[i] = None;
                    fresh.push(i);
                }
                Err(msg) => {
                    if status[i].is_none() {
                        warn!("upstream {} failed its healthcheck: {}", u, msg);
                        self.metrics
                            .on_upstream_status_changed(&u.to_string(), true, false);
                    }
                    status[i] = Some(Instant::now());
                    errs.push(msg);
                }
            }
        }

        *self.active.write().expect("active set poisoned") = fresh.clone();

        // Fallbacks are assumed reachable; each refresh re-asserts them so
        // dashboards show a heartbeat even while the primaries carry traffic.
        for f in &self.fallbacks {
            self.metrics
                .on_upstream_status_changed(&f.to_string(), false, true);
        }

        if fresh.is_empty() {
            Err(ForwardError::AllDown(errs.join("; ")))
        } else {
            Ok(())
        }
    }
}

// A/IN with recursion desired, the shape a stub sends. `${RANDOM}` defeats
// caches between us and the probed upstream.
fn probe_query(template: &str) -> Result<Message, ProtoError> {
    let domain = if template.contains("${RANDOM}") {
        let tag: u64 = rand::thread_rng().gen();
        template.replace("${RANDOM}", &hex::encode(tag.to_be_bytes()))
    } else {
        template.to_string()
    };

    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_utf8(&domain)?, RecordType::A));
    Ok(msg)
}
