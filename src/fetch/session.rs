//! Request bookkeeping for one observation

use std::collections::HashMap;
use types::Document;

/// Identifies one physical request (a one-shot read or a live subscription).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
  pub number: u64,
  pub id: String,
}

#[derive(Debug, Clone)]
struct InFlight {
  ticket: u64,
  id: String,
  /// The session sequence this request currently answers for. Coalesced
  /// observes move it forward.
  sequence: u64,
}

/// Outcome of [`FetchSession::issue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
  /// Start a new request under this ticket
  Fetch(Ticket),
  /// A request for the same id is already outstanding and now answers for
  /// the latest sequence
  Coalesced,
  /// No id is being observed
  Idle,
}

/// Mutable record of what one observer currently cares about.
///
/// Only a response whose ticket is the outstanding one, whose sequence is the
/// session's latest, for the id still observed, on a mounted session may
/// update observable state. Everything else is stale.
#[derive(Debug)]
pub struct FetchSession {
  current_id: Option<String>,
  sequence: u64,
  mounted: bool,
  in_flight: Option<InFlight>,
  next_ticket: u64,
  /// Last accepted version of every id this session has shown
  local: HashMap<String, Document>,
}

impl Default for FetchSession {
  fn default() -> Self {
    Self::new()
  }
}

impl FetchSession {
  pub fn new() -> Self {
    Self {
      current_id: None,
      sequence: 0,
      mounted: true,
      in_flight: None,
      next_ticket: 1,
      local: HashMap::new(),
    }
  }

  pub fn current_id(&self) -> Option<&str> {
    self.current_id.as_deref()
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn is_mounted(&self) -> bool {
    self.mounted
  }

  pub fn has_in_flight(&self) -> bool {
    self.in_flight.is_some()
  }

  /// Point the session at `id`. Returns `true` when the id changed, in which
  /// case the outstanding request (if any) loses its right to apply.
  pub fn switch_to(&mut self, id: &str) -> bool {
    if self.current_id.as_deref() == Some(id) {
      return false;
    }
    self.current_id = Some(id.to_string());
    self.sequence += 1;
    self.in_flight = None;
    true
  }

  /// Stop observing any id without unmounting.
  pub fn release(&mut self) {
    self.current_id = None;
    self.sequence += 1;
    self.in_flight = None;
  }

  /// Register an observe of the current id.
  pub fn issue(&mut self) -> Issue {
    let Some(id) = self.current_id.clone() else {
      return Issue::Idle;
    };
    self.sequence += 1;
    if let Some(in_flight) = &mut self.in_flight {
      if in_flight.id == id {
        in_flight.sequence = self.sequence;
        return Issue::Coalesced;
      }
    }

    let number = self.next_ticket;
    self.next_ticket += 1;
    self.in_flight = Some(InFlight {
      ticket: number,
      id: id.clone(),
      sequence: self.sequence,
    });
    Issue::Fetch(Ticket { number, id })
  }

  /// Drop the outstanding request so the next [`issue`](Self::issue) starts
  /// a fresh one. Used by refresh and retry.
  pub fn reset_guards(&mut self) {
    self.sequence += 1;
    self.in_flight = None;
  }

  /// Whether a response under `ticket` may update state.
  pub fn accepts(&self, ticket: &Ticket) -> bool {
    self.mounted
      && self.current_id.as_deref() == Some(ticket.id.as_str())
      && self
        .in_flight
        .as_ref()
        .is_some_and(|f| f.ticket == ticket.number && f.sequence == self.sequence)
  }

  /// [`accepts`](Self::accepts), then retire the request if `ticket` is the
  /// outstanding one.
  pub fn finish(&mut self, ticket: &Ticket) -> bool {
    let accepted = self.accepts(ticket);
    if self
      .in_flight
      .as_ref()
      .is_some_and(|f| f.ticket == ticket.number)
    {
      self.in_flight = None;
    }
    accepted
  }

  /// Stop applying anything. Responses still in flight are discarded.
  pub fn teardown(&mut self) {
    self.mounted = false;
    self.in_flight = None;
  }

  pub fn remember(&mut self, doc: &Document) {
    self.local.insert(doc.id.clone(), doc.clone());
  }

  pub fn recall(&self, id: &str) -> Option<Document> {
    self.local.get(id).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ticket(issue: Issue) -> Ticket {
    match issue {
      Issue::Fetch(t) => t,
      other => panic!("expected a fetch, got {:?}", other),
    }
  }

  #[test]
  fn id_change_discards_previous_request() {
    let mut session = FetchSession::new();
    session.switch_to("a");
    let a = ticket(session.issue());
    session.switch_to("b");
    let b = ticket(session.issue());

    assert!(!session.finish(&a));
    assert!(session.finish(&b));
  }

  #[test]
  fn same_id_observe_coalesces() {
    let mut session = FetchSession::new();
    session.switch_to("a");
    let a = ticket(session.issue());
    assert_eq!(session.issue(), Issue::Coalesced);
    assert_eq!(session.issue(), Issue::Coalesced);
    assert!(session.accepts(&a));
    assert!(session.finish(&a));
    assert!(!session.has_in_flight());
  }

  #[test]
  fn switching_back_issues_a_new_request() {
    let mut session = FetchSession::new();
    session.switch_to("a");
    let first = ticket(session.issue());
    session.switch_to("b");
    session.switch_to("a");
    let second = ticket(session.issue());
    assert_ne!(first, second);
    assert!(!session.finish(&first));
    assert!(session.finish(&second));
  }

  #[test]
  fn teardown_rejects_everything() {
    let mut session = FetchSession::new();
    session.switch_to("a");
    let a = ticket(session.issue());
    session.teardown();
    assert!(!session.finish(&a));
    assert!(!session.is_mounted());
  }

  #[test]
  fn reset_guards_allows_a_second_request() {
    let mut session = FetchSession::new();
    assert_eq!(session.issue(), Issue::Idle);
    session.switch_to("a");
    let first = ticket(session.issue());
    session.reset_guards();
    let second = ticket(session.issue());
    assert!(!session.finish(&first));
    assert!(session.finish(&second));
  }
}
