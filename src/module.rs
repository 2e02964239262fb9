//! The shared event-loop contract every module in this crate obeys.
//!
//! A host owns exactly one readiness primitive (`poll(2)` or equivalent). It
//! collects [`Module::pollfds`] from every module into one array, waits on
//! it, dispatches the resulting readiness set back into each module's
//! [`Module::update`], then drains [`Module::events`]. This trait exists to
//! document that shape and to let generic test harnesses drive arbitrary
//! modules; the concrete modules ([`crate::afs::Afs`], [`crate::https::Https`])
//! also expose the same operations as inherent methods so call sites never
//! pay for dynamic dispatch.

/// The two-phase shutdown handshake every module implements.
///
/// `stop_prep` requests graceful quiescence; it is idempotent but must not
/// be issued again before an intervening `stopped`-shaped event has been
/// observed. `stop` is the final teardown and is legal only after that
/// event. Between the two calls no new operations are accepted — modules
/// that receive one panic via the `bug!` contract-violation path.
pub trait Module {
    /// Readiness descriptor, as handed to the host's `poll` array.
    type PollFd: Copy;
    /// One event produced by a call to [`Module::update`].
    type Event;

    /// Writes the descriptors this module wants included in the host's next
    /// readiness wait. Returns the number of entries written.
    fn pollfds(&self, out: &mut [Self::PollFd]) -> usize;

    /// Consumes the readiness set observed by the host and advances this
    /// module's internal state machines. May be called with an empty
    /// intersection (it still drives `stop_prep` transitions and retries)
    /// and may produce zero events.
    fn update(&mut self, fds: &[Self::PollFd]);

    /// Returns the events produced by the last `update` call. The returned
    /// slice is only valid until the next call to `update`.
    fn events(&self) -> &[Self::Event];

    /// Requests graceful quiescence. Idempotent; must not be called twice
    /// without an intervening `stopped` event.
    fn stop_prep(&mut self);

    /// Final teardown. Legal only after this module has reported its
    /// `stopped` event.
    fn stop(self);
}
