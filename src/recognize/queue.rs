//! Single-flight recognition request queue.
//!
//! At most one request is outstanding at any instant. Frames enqueued while a request
//! is in flight land in a single pending slot; a newer frame overwrites an older one
//! (latest wins). When the in-flight request completes, the pending frame (if any) is
//! dispatched immediately.
//!
//! The queue never retries. A failed request is reported once; the next sampling tick
//! supplies a fresh frame.

use std::time::{Duration, Instant, SystemTime};

use super::{RecognitionError, RecognitionResponse};
use crate::frame::{FrameDims, SampledFrame};

/// Monotonic request identifier, unique per queue.
pub type RequestId = u64;

/// A frame handed to a dispatcher.
#[derive(Debug)]
pub struct RequestTicket {
    pub id: RequestId,
    pub frame: SampledFrame,
}

/// Result of one dispatched request, delivered back to the queue.
#[derive(Debug)]
pub struct Completion {
    pub request_id: RequestId,
    pub outcome: Result<RecognitionResponse, RecognitionError>,
    /// When the call returned, stamped by the dispatcher.
    pub finished_at: Instant,
}

/// Starts a request without blocking. The outcome must later be fed back through
/// `RequestQueue::complete`.
pub trait Dispatcher {
    fn dispatch(&mut self, ticket: RequestTicket);
}

impl<D: Dispatcher + ?Sized> Dispatcher for Box<D> {
    fn dispatch(&mut self, ticket: RequestTicket) {
        (**self).dispatch(ticket)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Sent immediately.
    Dispatched(RequestId),
    /// Stored in the pending slot. `replaced` is true when an older pending frame was
    /// discarded.
    Coalesced { replaced: bool },
}

/// What the queue reports when a request completes.
#[derive(Debug)]
pub enum QueueEvent {
    Response {
        request_id: RequestId,
        response: RecognitionResponse,
        /// Dimensions of the frame the detections refer to.
        frame: FrameDims,
        captured_at: SystemTime,
        latency: Duration,
        /// Pending frame dispatched as a consequence of this completion.
        next: Option<RequestId>,
    },
    Failure {
        request_id: RequestId,
        error: RecognitionError,
        latency: Duration,
        next: Option<RequestId>,
    },
}

impl QueueEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            QueueEvent::Response { request_id, .. } | QueueEvent::Failure { request_id, .. } => {
                *request_id
            }
        }
    }

    pub fn next(&self) -> Option<RequestId> {
        match self {
            QueueEvent::Response { next, .. } | QueueEvent::Failure { next, .. } => *next,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub dispatched: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
}

struct InFlight {
    id: RequestId,
    frame: FrameDims,
    captured_at: SystemTime,
    dispatched_at: Instant,
}

pub struct RequestQueue<D: Dispatcher> {
    dispatcher: D,
    in_flight: Option<InFlight>,
    pending: Option<SampledFrame>,
    next_id: RequestId,
    stats: QueueStats,
}

impl<D: Dispatcher> RequestQueue<D> {
    pub fn new(dispatcher: D) -> Self {
        Self {
            dispatcher,
            in_flight: None,
            pending: None,
            next_id: 1,
            stats: QueueStats::default(),
        }
    }

    /// Queue a frame. Never blocks and never fails.
    pub fn enqueue(&mut self, frame: SampledFrame, now: Instant) -> EnqueueOutcome {
        if self.in_flight.is_some() {
            let replaced = self.pending.replace(frame).is_some();
            self.stats.coalesced += 1;
            if replaced {
                self.stats.dropped += 1;
                log::debug!("RequestQueue: replaced pending frame with newer one");
            }
            return EnqueueOutcome::Coalesced { replaced };
        }
        EnqueueOutcome::Dispatched(self.send(frame, now))
    }

    /// Feed back a completion. Returns `None` for completions that do not belong to
    /// the in-flight request. Latency runs from dispatch to `finished_at`; the pending
    /// frame, if any, is dispatched at `now`.
    pub fn complete(&mut self, completion: Completion, now: Instant) -> Option<QueueEvent> {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.id == completion.request_id);
        if !matches {
            log::warn!(
                "RequestQueue: ignoring completion for unknown request {}",
                completion.request_id
            );
            return None;
        }
        let in_flight = self.in_flight.take()?;
        let latency = completion
            .finished_at
            .saturating_duration_since(in_flight.dispatched_at);
        let next = self.pending.take().map(|frame| self.send(frame, now));

        let event = match completion.outcome {
            Ok(response) => {
                self.stats.succeeded += 1;
                QueueEvent::Response {
                    request_id: in_flight.id,
                    response,
                    frame: in_flight.frame,
                    captured_at: in_flight.captured_at,
                    latency,
                    next,
                }
            }
            Err(error) => {
                self.stats.failed += 1;
                QueueEvent::Failure {
                    request_id: in_flight.id,
                    error,
                    latency,
                    next,
                }
            }
        };
        Some(event)
    }

    /// Drop the pending frame. An in-flight request is unaffected.
    pub fn clear(&mut self) -> bool {
        let dropped = self.pending.take().is_some();
        if dropped {
            self.stats.dropped += 1;
        }
        dropped
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn in_flight_id(&self) -> Option<RequestId> {
        self.in_flight.as_ref().map(|f| f.id)
    }

    /// Identifier the next dispatched request will receive.
    pub fn next_request_id(&self) -> RequestId {
        self.next_id
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    fn send(&mut self, frame: SampledFrame, now: Instant) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.in_flight = Some(InFlight {
            id,
            frame: frame.dims(),
            captured_at: frame.captured_at,
            dispatched_at: now,
        });
        self.stats.dispatched += 1;
        log::debug!(
            "RequestQueue: dispatching request {} ({}x{}, {} bytes)",
            id,
            frame.width,
            frame.height,
            frame.payload().len()
        );
        self.dispatcher.dispatch(RequestTicket { id, frame });
        id
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognize::{BoundingBox, Detection, Identity};

    #[derive(Default)]
    struct Recorder {
        sent: Vec<RequestTicket>,
    }

    impl Dispatcher for Recorder {
        fn dispatch(&mut self, ticket: RequestTicket) {
            self.sent.push(ticket);
        }
    }

    fn frame(tag: u8) -> SampledFrame {
        SampledFrame::new(vec![tag], 1280, 740, 1280, 720, SystemTime::now())
    }

    fn ok(id: RequestId) -> Completion {
        Completion {
            request_id: id,
            finished_at: Instant::now(),
            outcome: Ok(RecognitionResponse {
                detections: vec![Detection {
                    identity: Identity::Unrecognized,
                    bounding_box: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
                    distance: None,
                }],
                processing_time: None,
            }),
        }
    }

    fn payload_tags(queue: &RequestQueue<Recorder>) -> Vec<u8> {
        queue.dispatcher().sent.iter().map(|t| t.frame.payload()[0]).collect()
    }

    #[test]
    fn idle_queue_dispatches_immediately() {
        let mut queue = RequestQueue::new(Recorder::default());
        let now = Instant::now();
        assert_eq!(queue.enqueue(frame(1), now), EnqueueOutcome::Dispatched(1));
        assert!(queue.is_busy());
        assert!(!queue.has_pending());
        assert_eq!(payload_tags(&queue), vec![1]);
    }

    #[test]
    fn busy_queue_keeps_only_latest_pending() {
        let mut queue = RequestQueue::new(Recorder::default());
        let now = Instant::now();
        queue.enqueue(frame(1), now);
        assert_eq!(
            queue.enqueue(frame(2), now),
            EnqueueOutcome::Coalesced { replaced: false }
        );
        assert_eq!(
            queue.enqueue(frame(3), now),
            EnqueueOutcome::Coalesced { replaced: true }
        );
        assert_eq!(
            queue.enqueue(frame(4), now),
            EnqueueOutcome::Coalesced { replaced: true }
        );
        // Still exactly one outstanding call.
        assert_eq!(queue.dispatcher().sent.len(), 1);

        let event = queue.complete(ok(1), now).expect("event");
        assert_eq!(event.next(), Some(2));
        assert_eq!(payload_tags(&queue), vec![1, 4]);
        assert!(!queue.has_pending());

        let event = queue.complete(ok(2), now).expect("event");
        assert_eq!(event.next(), None);
        assert!(!queue.is_busy());
        let stats = queue.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.succeeded, 2);
    }

    #[test]
    fn failure_still_drains_pending() {
        let mut queue = RequestQueue::new(Recorder::default());
        let start = Instant::now();
        queue.enqueue(frame(1), start);
        queue.enqueue(frame(2), start);
        let later = start + Duration::from_millis(250);
        let event = queue
            .complete(
                Completion {
                    request_id: 1,
                    outcome: Err(RecognitionError::timeout("10s elapsed")),
                    finished_at: later,
                },
                later + Duration::from_millis(20),
            )
            .expect("event");
        match event {
            QueueEvent::Failure {
                error,
                latency,
                next,
                ..
            } => {
                assert!(error.is_timeout());
                assert_eq!(latency, Duration::from_millis(250));
                assert_eq!(next, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(payload_tags(&queue), vec![1, 2]);
    }

    #[test]
    fn latency_ends_when_the_call_returned() {
        let mut queue = RequestQueue::new(Recorder::default());
        let start = Instant::now();
        queue.enqueue(frame(1), start);
        queue.enqueue(frame(2), start);
        let returned = start + Duration::from_millis(80);
        let polled = returned + Duration::from_millis(20);
        let mut completion = ok(1);
        completion.finished_at = returned;
        match queue.complete(completion, polled).expect("event") {
            QueueEvent::Response { latency, next, .. } => {
                assert_eq!(latency, Duration::from_millis(80));
                assert_eq!(next, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }

        // A stamp from before dispatch saturates to zero.
        let mut completion = ok(2);
        completion.finished_at = start;
        match queue.complete(completion, polled).expect("event") {
            QueueEvent::Response { latency, .. } => assert_eq!(latency, Duration::ZERO),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn response_reports_producing_frame_dims() {
        let mut queue = RequestQueue::new(Recorder::default());
        let now = Instant::now();
        queue.enqueue(frame(1), now);
        match queue.complete(ok(1), now).expect("event") {
            QueueEvent::Response { frame, response, .. } => {
                assert_eq!(frame, FrameDims::new(1280, 740));
                assert_eq!(response.detections.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_completions_are_ignored() {
        let mut queue = RequestQueue::new(Recorder::default());
        let now = Instant::now();
        assert!(queue.complete(ok(7), now).is_none());
        queue.enqueue(frame(1), now);
        assert!(queue.complete(ok(2), now).is_none());
        assert!(queue.is_busy());
        assert!(queue.complete(ok(1), now).is_some());
    }

    #[test]
    fn clear_drops_pending_only() {
        let mut queue = RequestQueue::new(Recorder::default());
        let now = Instant::now();
        assert!(!queue.clear());
        queue.enqueue(frame(1), now);
        queue.enqueue(frame(2), now);
        assert!(queue.clear());
        assert!(queue.is_busy());
        assert_eq!(queue.in_flight_id(), Some(1));

        let event = queue.complete(ok(1), now).expect("event");
        assert_eq!(event.next(), None);
        assert_eq!(payload_tags(&queue), vec![1]);
    }

    #[test]
    fn sent_frame_is_latest_at_completion_time() {
        // Interleave enqueues and completions; every dispatched frame after the
        // first must be the newest enqueued before the previous completion.
        let mut queue = RequestQueue::new(Recorder::default());
        let now = Instant::now();
        let mut latest_pending = None;
        let mut expected = Vec::new();
        for tag in 0u8..40 {
            match queue.enqueue(frame(tag), now) {
                EnqueueOutcome::Dispatched(_) => expected.push(tag),
                EnqueueOutcome::Coalesced { .. } => latest_pending = Some(tag),
            }
            assert!(queue.dispatcher().sent.len() <= expected.len());
            if tag % 3 == 2 {
                let id = queue.in_flight_id().expect("in flight");
                let event = queue.complete(ok(id), now).expect("event");
                if event.next().is_some() {
                    expected.push(latest_pending.take().expect("pending tag"));
                }
            }
        }
        assert_eq!(payload_tags(&queue), expected);
    }
}
