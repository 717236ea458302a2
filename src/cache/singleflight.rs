//! In-process single-flight coordination.
//!
//! Concurrent local callers for the same key share one resolution before
//! anything is sent to the store; the distributed lock still coordinates
//! across processes. The leading caller publishes its outcome over a watch
//! channel; followers receive clones. A leader that is dropped before
//! publishing closes the channel, and a waiting follower races to take over
//! the lead instead of hanging.

use crate::core::error::StrataResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::watch;

type Outcome = StrataResult<String>;
type Flight = watch::Receiver<Option<Outcome>>;

/// Per-key coalescing table.
pub(crate) struct Group {
    flights: Mutex<HashMap<String, Flight>>,
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(Flight),
}

impl Group {
    pub(crate) fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, sharing one execution among concurrent callers.
    pub(crate) async fn run<F, Fut>(&self, key: &str, work: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let mut work = Some(work);
        loop {
            let role = {
                let mut flights = self.flights.lock();
                match flights.get(key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        flights.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };
            match role {
                Role::Leader(tx) => {
                    let flight = FlightGuard { group: self, key };
                    let work = work.take().expect("a caller leads at most once");
                    let outcome = work().await;
                    // Retire the flight before publishing so late arrivals
                    // start a fresh one instead of reading a settled result.
                    drop(flight);
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome;
                }
                Role::Follower(mut rx) => loop {
                    let settled = rx.borrow_and_update().clone();
                    if let Some(outcome) = settled {
                        return outcome;
                    }
                    if rx.changed().await.is_err() {
                        // Leader dropped without publishing; race for the
                        // lead and run the work ourselves.
                        break;
                    }
                },
            }
        }
    }
}

/// Removes the flight entry even if the leader unwinds or is dropped.
struct FlightGuard<'a> {
    group: &'a Group,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.group.flights.lock().remove(self.key);
    }
}
