//! Per-peer serialized command execution.
//!
//! Each connected peer gets a worker thread that owns the peer's FIFO queue. The worker takes the
//! next command only once the previous one has reached a terminal state, so the transport never
//! sees two requests in flight for the same peer. Transport completions are routed into the
//! worker's inbox and matched against the in-flight command by [`RequestId`]; anything that
//! doesn't match is a leftover from an earlier command and gets dropped. Notifications carry no
//! request id, so a command only accepts them once its own request went out: a read after its
//! matching response, a write after its first chunk.

use log::*;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::transport::{ConnectionHandle, RequestId, Transport};
use crate::uuid::Uuid;
use super::command::{Completion, FramePredicate, FrameSpec, Operation, Outcome, Response};
use super::frame::FrameBuffer;
use super::peripheral::PeerAddress;

/// A command waiting for or undergoing execution.
pub(in crate) struct Job {
    operation: Operation,
    deadline: Option<Instant>,
    description: String,
    completion: Completion,
    notify: bool,
}

impl Job {
    /// The deadline starts counting now.
    pub fn new(operation: Operation, timeout: Option<Duration>, description: String,
        completion: Completion) -> Self
    {
        Self {
            operation,
            deadline: timeout.map(|t| Instant::now() + t),
            description,
            completion,
            notify: false,
        }
    }

    /// Notifications of the characteristic must be enabled before the job runs.
    pub fn with_notifications(mut self, v: bool) -> Self {
        self.notify = v;
        self
    }

    pub fn characteristic(&self) -> Option<Uuid> {
        self.operation.characteristic()
    }

    pub fn is_write(&self) -> bool {
        match self.operation {
            Operation::Write { .. } => true,
            _ => false,
        }
    }

    /// A write that completes with the peer's reply.
    pub fn awaits_reply(&self) -> bool {
        match self.operation {
            Operation::Write { response: Some(_), .. } => true,
            _ => false,
        }
    }

    pub fn complete(self, outcome: Outcome) {
        (self.completion)(outcome)
    }
}

/// Transport completion addressed to a peer.
#[derive(Debug)]
pub(in crate) enum PeerSignal {
    Read {
        request: RequestId,
        characteristic: Uuid,
        value: Result<Vec<u8>, Error>,
    },
    Changed {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Written {
        request: RequestId,
        result: Result<(), Error>,
    },
    TransferUnit {
        request: RequestId,
        result: Result<u16, Error>,
    },
}

enum Message {
    Submit(Job),
    Signal(PeerSignal),
    Close,
}

pub(in crate) struct Worker {
    inbox: mpsc::Sender<Message>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Worker {
    pub fn spawn(address: PeerAddress, handle: ConnectionHandle, transport: Arc<dyn Transport>,
        chunk_delay: Duration) -> Result<Self, Error>
    {
        let (inbox, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("ble-peer-{}", address))
            .spawn(move || Pipeline {
                address,
                handle,
                transport,
                chunk_delay,
                queue: VecDeque::new(),
                inbox: receiver,
                subscribed: HashSet::new(),
            }.run())?;
        Ok(Self {
            inbox,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    /// Hands the job back if the worker is gone.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        self.inbox.send(Message::Submit(job)).map_err(|e| match e.0 {
            Message::Submit(job) => job,
            _ => unreachable!(),
        })
    }

    pub fn signal(&self, signal: PeerSignal) {
        if let Err(e) = self.inbox.send(Message::Signal(signal)) {
            debug!("dropping signal for a stopped worker: {:?}", match e.0 {
                Message::Signal(s) => s,
                _ => unreachable!(),
            });
        }
    }

    /// Fails the in-flight and queued commands with `ConnectionClosed` and waits for the worker
    /// to exit. Doesn't wait when called from a completion running on the worker itself.
    pub fn close(mut self) {
        let _ = self.inbox.send(Message::Close);
        if let Some(thread) = self.thread.take() {
            if thread::current().id() != self.thread_id {
                let _ = thread.join();
            }
        }
    }
}

struct Pipeline {
    address: PeerAddress,
    handle: ConnectionHandle,
    transport: Arc<dyn Transport>,
    chunk_delay: Duration,
    queue: VecDeque<Job>,
    inbox: mpsc::Receiver<Message>,

    /// Characteristics with notifications enabled.
    subscribed: HashSet<Uuid>,
}

impl Pipeline {
    fn run(mut self) {
        debug!("{}: pipeline started", self.address);
        loop {
            let job = match self.queue.pop_front() {
                Some(job) => job,
                None => match self.inbox.recv() {
                    Ok(Message::Submit(job)) => job,
                    Ok(Message::Signal(s)) => {
                        debug!("{}: discarding {:?}: nothing in flight", self.address, s);
                        continue;
                    }
                    Ok(Message::Close) | Err(_) => break,
                }
            };
            if !self.execute(job) {
                break;
            }
        }

        while let Ok(msg) = self.inbox.try_recv() {
            if let Message::Submit(job) = msg {
                self.queue.push_back(job);
            }
        }
        if !self.queue.is_empty() {
            debug!("{}: failing {} queued commands", self.address, self.queue.len());
        }
        for job in self.queue.drain(..) {
            job.complete(Err(Error::connection_closed()));
        }
        debug!("{}: pipeline stopped", self.address);
    }

    /// Runs `job` to its terminal state. Returns `false` if the pipeline got closed meanwhile.
    fn execute(&mut self, job: Job) -> bool {
        if job.deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            warn!("{}: {} expired while queued", self.address, job.description);
            job.complete(Err(Error::timeout()));
            return true;
        }

        // Signals still waiting belong to commands that already completed.
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                Message::Submit(next) => self.queue.push_back(next),
                Message::Signal(s) => debug!("{}: discarding stale {:?}", self.address, s),
                Message::Close => {
                    job.complete(Err(Error::connection_closed()));
                    return false;
                }
            }
        }

        debug!("{}: start executing {}", self.address, job.description);
        let mut active = match self.subscribe(&job).and_then(|_| self.issue(&job.operation)) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: {} failed: {}", self.address, job.description, e);
                job.complete(Err(e));
                return true;
            }
        };

        loop {
            if let Some(outcome) = active.poll_send(self) {
                self.finish(job, outcome);
                return true;
            }

            let now = Instant::now();
            if job.deadline.map(|d| now >= d).unwrap_or(false) {
                warn!("{}: {} timed out", self.address, job.description);
                job.complete(Err(Error::timeout()));
                return true;
            }

            let wakeup = match (job.deadline, active.next_send_at()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let msg = match wakeup {
                Some(at) => match self.inbox.recv_timeout(at.saturating_duration_since(now)) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => Message::Close,
                },
                None => self.inbox.recv().unwrap_or(Message::Close),
            };

            match msg {
                Message::Submit(next) => self.queue.push_back(next),
                Message::Signal(signal) => {
                    if let Some(outcome) = active.on_signal(signal, &self.address) {
                        self.finish(job, outcome);
                        return true;
                    }
                }
                Message::Close => {
                    debug!("{}: {} interrupted by close", self.address, job.description);
                    job.complete(Err(Error::connection_closed()));
                    return false;
                }
            }
        }
    }

    fn finish(&self, job: Job, outcome: Outcome) {
        match &outcome {
            Ok(_) => debug!("{}: {} done", self.address, job.description),
            Err(e) => warn!("{}: {} failed: {}", self.address, job.description, e),
        }
        job.complete(outcome);
    }

    fn subscribe(&mut self, job: &Job) -> Result<(), Error> {
        let characteristic = match job.operation.notified_characteristic() {
            Some(v) if job.notify && !self.subscribed.contains(&v) => v,
            _ => return Ok(()),
        };
        debug!("{}: enabling notifications of {}", self.address, characteristic);
        self.transport.set_notify(self.handle, characteristic, true)?;
        self.subscribed.insert(characteristic);
        Ok(())
    }

    fn issue(&self, operation: &Operation) -> Result<InFlight, Error> {
        Ok(match operation {
            &Operation::Read { characteristic, max_frame_size, ref whole_frame } => {
                let request = RequestId::next();
                self.transport.read_characteristic(self.handle, characteristic, request)?;
                InFlight::Read {
                    request,
                    characteristic,
                    frame: FrameBuffer::new(max_frame_size),
                    whole_frame: whole_frame.clone(),
                    armed: false,
                }
            }
            Operation::Write { characteristic, chunks, response } => InFlight::Write(WriteProgress {
                characteristic: *characteristic,
                unsent: chunks.iter().cloned().collect(),
                awaiting: HashSet::new(),
                outstanding: chunks.len(),
                next_send_at: Instant::now(),
                started: false,
                reply: response.as_ref().map(|&FrameSpec { max_frame_size, ref whole_frame }| Reply {
                    frame: FrameBuffer::new(max_frame_size),
                    whole_frame: whole_frame.clone(),
                    whole: false,
                }),
            }),
            &Operation::SetTransferUnit { size } => {
                let request = RequestId::next();
                self.transport.negotiate_transfer_unit(self.handle, size, request)?;
                InFlight::TransferUnit { request }
            }
        })
    }
}

struct WriteProgress {
    characteristic: Uuid,
    unsent: VecDeque<Vec<u8>>,

    /// Requests sent and not acknowledged yet.
    awaiting: HashSet<RequestId>,

    /// Chunks not acknowledged yet, sent or not. Only the worker touches it.
    outstanding: usize,

    next_send_at: Instant,

    /// At least one chunk went out.
    started: bool,

    reply: Option<Reply>,
}

struct Reply {
    frame: FrameBuffer,
    whole_frame: FramePredicate,
    whole: bool,
}

impl WriteProgress {
    fn outcome(&mut self) -> Option<Outcome> {
        if self.outstanding > 0 {
            return None;
        }
        match &mut self.reply {
            None => Some(Ok(Response::Written)),
            Some(r) if r.whole => {
                let frame = std::mem::replace(&mut r.frame, FrameBuffer::new(0));
                Some(Ok(Response::Read(frame.into_vec())))
            }
            Some(_) => {
                trace!("every chunk of {} acknowledged, awaiting reply", self.characteristic);
                None
            }
        }
    }
}

enum InFlight {
    Read {
        request: RequestId,
        characteristic: Uuid,
        frame: FrameBuffer,
        whole_frame: FramePredicate,

        /// The response to this read arrived, so notifications belong to it.
        armed: bool,
    },
    Write(WriteProgress),
    TransferUnit {
        request: RequestId,
    },
}

impl InFlight {
    fn next_send_at(&self) -> Option<Instant> {
        match self {
            InFlight::Write(w) if !w.unsent.is_empty() => Some(w.next_send_at),
            _ => None,
        }
    }

    /// Sends the next write chunk if it's due.
    fn poll_send(&mut self, pipeline: &Pipeline) -> Option<Outcome> {
        let w = match self {
            InFlight::Write(w) => w,
            _ => return None,
        };
        let now = Instant::now();
        if w.unsent.is_empty() || now < w.next_send_at {
            return None;
        }
        let chunk = w.unsent.pop_front()?;
        let request = RequestId::next();
        trace!("{}: writing {} bytes to {} ({} left)",
            pipeline.address, chunk.len(), w.characteristic, w.unsent.len());
        if let Err(e) = pipeline.transport.write_characteristic(pipeline.handle, w.characteristic,
            &chunk, request)
        {
            return Some(Err(e));
        }
        w.awaiting.insert(request);
        w.started = true;
        w.next_send_at = now + pipeline.chunk_delay;
        None
    }

    /// Returns the outcome once the signal completes the command.
    fn on_signal(&mut self, signal: PeerSignal, address: &PeerAddress) -> Option<Outcome> {
        match (self, signal) {
            (InFlight::Read { request, characteristic, frame, whole_frame, armed },
                PeerSignal::Read { request: r, characteristic: c, value })
                if *request == r && *characteristic == c =>
            {
                *armed = true;
                match value {
                    Ok(value) => Self::append(frame, whole_frame, &value, c, address),
                    Err(e) => Some(Err(e)),
                }
            }
            (InFlight::Read { characteristic, frame, whole_frame, armed: true, .. },
                PeerSignal::Changed { characteristic: c, value })
                if *characteristic == c =>
            {
                Self::append(frame, whole_frame, &value, c, address)
            }
            (InFlight::Write(w), PeerSignal::Changed { characteristic, value })
                if w.started && w.characteristic == characteristic =>
            {
                let reply = match &mut w.reply {
                    Some(r) if !r.whole => r,
                    _ => return None,
                };
                if let Err(e) = reply.frame.push(&value) {
                    return Some(Err(e));
                }
                trace!("{}: reply from {} has {} bytes",
                    address, characteristic, reply.frame.as_slice().len());
                reply.whole = (reply.whole_frame)(reply.frame.as_slice());
                w.outcome()
            }
            (InFlight::Write(w), PeerSignal::Written { request, result })
                if w.awaiting.contains(&request) =>
            {
                w.awaiting.remove(&request);
                match result {
                    Ok(()) => {
                        w.outstanding -= 1;
                        w.outcome()
                    }
                    Err(e) => {
                        if !w.unsent.is_empty() {
                            debug!("{}: cancelling {} unsent chunks", address, w.unsent.len());
                        }
                        Some(Err(e))
                    }
                }
            }
            (InFlight::TransferUnit { request }, PeerSignal::TransferUnit { request: r, result })
                if *request == r =>
            {
                Some(result.map(Response::TransferUnit))
            }
            (_, PeerSignal::Changed { .. }) => None,
            (_, signal) => {
                debug!("{}: discarding {:?}", address, signal);
                None
            }
        }
    }

    fn append(frame: &mut FrameBuffer, whole_frame: &FramePredicate, packet: &[u8],
        characteristic: Uuid, address: &PeerAddress) -> Option<Outcome>
    {
        if let Err(e) = frame.push(packet) {
            return Some(Err(e));
        }
        trace!("{}: {} has {} bytes", address, characteristic, frame.as_slice().len());
        if whole_frame(frame.as_slice()) {
            let frame = std::mem::replace(frame, FrameBuffer::new(0));
            Some(Ok(Response::Read(frame.into_vec())))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::{Call, MockTransport};
    use hex_literal::hex;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";
    const HANDLE: ConnectionHandle = ConnectionHandle(1);
    const WAIT: Duration = Duration::from_secs(2);

    fn uuid() -> Uuid {
        Uuid::from_u16(0xffe1)
    }

    fn worker(mock: &MockTransport, chunk_delay: Duration) -> Worker {
        Worker::spawn(ADDR.into(), HANDLE, Arc::new(mock.clone()), chunk_delay).unwrap()
    }

    fn read(timeout: Option<Duration>, whole_frame: FramePredicate,
        done: mpsc::Sender<(usize, Outcome)>, id: usize) -> Job
    {
        Job::new(Operation::Read {
                characteristic: uuid(),
                max_frame_size: 16,
                whole_frame,
            },
            timeout,
            format!("read #{}", id),
            Box::new(move |o: Outcome| done.send((id, o)).unwrap()))
    }

    fn any() -> FramePredicate {
        Arc::new(|b: &[u8]| !b.is_empty())
    }

    fn read_requests(mock: &MockTransport, n: usize) -> Vec<RequestId> {
        mock.wait_for_calls(is_read, n, WAIT).unwrap().into_iter()
            .filter_map(|c| match c {
                Call::Read { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }

    fn is_read(c: &Call) -> bool {
        match c { Call::Read { .. } => true, _ => false }
    }

    fn is_write(c: &Call) -> bool {
        match c { Call::Write { .. } => true, _ => false }
    }

    fn read_ok(request: RequestId, value: &[u8]) -> PeerSignal {
        PeerSignal::Read {
            request,
            characteristic: uuid(),
            value: Ok(value.to_vec()),
        }
    }

    #[test]
    fn commands_run_one_at_a_time_in_order() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            w.submit(read(None, any(), tx.clone(), i)).ok().unwrap();
        }

        for i in 0..3 {
            let requests = read_requests(&mock, i + 1);
            thread::sleep(Duration::from_millis(50));
            // The next read isn't issued before the current one completes.
            assert_eq!(mock.calls().iter().filter(|c| is_read(c)).count(), i + 1);
            w.signal(read_ok(requests[i], &[i as u8]));
            let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(id, i);
            assert_eq!(outcome.unwrap(), Response::Read(vec![i as u8]));
        }
        w.close();
    }

    #[test]
    fn read_reassembles_frame() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(None, Arc::new(|b: &[u8]| b.len() >= 6), tx, 0)).ok().unwrap();

        let request = read_requests(&mock, 1)[0];
        w.signal(read_ok(request, &hex!("0102")));
        w.signal(PeerSignal::Changed { characteristic: Uuid::from_u16(0x2a19), value: vec![0xff] });
        w.signal(PeerSignal::Changed { characteristic: uuid(), value: hex!("0304").to_vec() });
        w.signal(PeerSignal::Changed { characteristic: uuid(), value: hex!("0506").to_vec() });

        let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcome.unwrap(), Response::Read(hex!("010203040506").to_vec()));
        w.close();
    }

    #[test]
    fn incomplete_frame_times_out() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(Some(Duration::from_millis(100)), Arc::new(|b: &[u8]| b.len() >= 6), tx, 0))
            .ok().unwrap();

        let request = read_requests(&mock, 1)[0];
        w.signal(read_ok(request, &hex!("0102")));
        let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::Timeout);
        w.close();
    }

    #[test]
    fn oversized_frame_fails() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(None, Arc::new(|_: &[u8]| false), tx, 0)).ok().unwrap();

        let request = read_requests(&mock, 1)[0];
        w.signal(read_ok(request, &[0; 10]));
        w.signal(PeerSignal::Changed { characteristic: uuid(), value: vec![0; 10] });
        let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::FrameOverflow);
        w.close();
    }

    #[test]
    fn read_failure_completes_immediately() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(None, any(), tx, 0)).ok().unwrap();

        let request = read_requests(&mock, 1)[0];
        w.signal(PeerSignal::Read {
            request,
            characteristic: uuid(),
            value: Err(Error::new(ErrorKind::Transport, "read failed: 133")),
        });
        let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcome.unwrap_err().description(), "read failed: 133");
        w.close();
    }

    #[test]
    fn timeout_releases_slot_and_late_signal_is_ignored() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(Some(Duration::from_millis(50)), any(), tx.clone(), 0)).ok().unwrap();
        w.submit(read(None, any(), tx, 1)).ok().unwrap();

        let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(id, 0);
        assert!(outcome.unwrap_err().is_timeout());

        let requests = read_requests(&mock, 2);
        w.signal(read_ok(requests[0], b"late"));
        w.signal(PeerSignal::Read {
            request: requests[0],
            characteristic: uuid(),
            value: Err(Error::new(ErrorKind::Transport, "late failure")),
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        w.signal(read_ok(requests[1], b"ok"));
        let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(id, 1);
        assert_eq!(outcome.unwrap(), Response::Read(b"ok".to_vec()));
        w.close();
    }

    #[test]
    fn late_notification_stays_out_of_next_read() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        let four = || -> FramePredicate { Arc::new(|b: &[u8]| b.len() >= 4) };
        w.submit(read(Some(Duration::from_millis(50)), four(), tx.clone(), 0)).ok().unwrap();
        w.submit(read(None, four(), tx, 1)).ok().unwrap();

        let first = read_requests(&mock, 1)[0];
        w.signal(read_ok(first, &hex!("0102")));
        let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(id, 0);
        assert!(outcome.unwrap_err().is_timeout());

        let second = read_requests(&mock, 2)[1];
        // The rest of the first frame, arriving after the first read gave up.
        w.signal(changed(&hex!("0304")));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        w.signal(read_ok(second, &hex!("0506")));
        w.signal(changed(&hex!("0708")));
        let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(id, 1);
        assert_eq!(outcome.unwrap(), Response::Read(hex!("05060708").to_vec()));
        w.close();
    }

    #[test]
    fn response_for_other_characteristic_is_ignored() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(None, any(), tx, 0)).ok().unwrap();

        let request = read_requests(&mock, 1)[0];
        w.signal(PeerSignal::Read {
            request,
            characteristic: Uuid::from_u16(0x2a19),
            value: Ok(vec![9]),
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        w.signal(read_ok(request, &[1]));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().1.unwrap(), Response::Read(vec![1]));
        w.close();
    }

    #[test]
    fn notifications_enabled_once_before_first_read() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        for i in 0..2 {
            w.submit(read(None, any(), tx.clone(), i).with_notifications(true)).ok().unwrap();
        }

        for i in 0..2 {
            let request = read_requests(&mock, i + 1)[i];
            w.signal(read_ok(request, &[1]));
            rx.recv_timeout(WAIT).unwrap().1.unwrap();
        }
        let calls: Vec<_> = mock.calls().into_iter()
            .filter(|c| match c {
                Call::SetNotify { .. } | Call::Read { .. } => true,
                _ => false,
            })
            .collect();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], Call::SetNotify { handle: HANDLE, characteristic: uuid(), enabled: true });
        assert!(is_read(&calls[1]) && is_read(&calls[2]));
        w.close();
    }

    #[test]
    fn plain_read_leaves_notifications_alone() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(None, any(), tx, 0)).ok().unwrap();
        let request = read_requests(&mock, 1)[0];
        w.signal(read_ok(request, &[1]));
        rx.recv_timeout(WAIT).unwrap().1.unwrap();
        assert!(!mock.calls().iter().any(|c| match c { Call::SetNotify { .. } => true, _ => false }));
        w.close();
    }

    #[test]
    fn failing_subscription_fails_command() {
        let mock = MockTransport::scripted().without_notifications();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(None, any(), tx, 0).with_notifications(true)).ok().unwrap();
        let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::OperationNotSupported);
        assert!(!mock.calls().iter().any(is_read));
        w.close();
    }

    #[test]
    fn expired_while_queued_skips_transport() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(read(None, any(), tx.clone(), 0)).ok().unwrap();
        w.submit(read(Some(Duration::from_millis(10)), any(), tx, 1)).ok().unwrap();

        let request = read_requests(&mock, 1)[0];
        thread::sleep(Duration::from_millis(50));
        w.signal(read_ok(request, &[1]));

        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, 0);
        let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(id, 1);
        assert!(outcome.unwrap_err().is_timeout());
        assert_eq!(mock.calls().iter().filter(|c| is_read(c)).count(), 1);
        w.close();
    }

    fn write(payload: Vec<u8>, chunk_size: usize, timeout: Option<Duration>,
        done: mpsc::Sender<Outcome>) -> Job
    {
        Job::new(Operation::Write {
                characteristic: uuid(),
                chunks: crate::central::frame::split(&payload, chunk_size),
                response: None,
            },
            timeout,
            "write".into(),
            Box::new(move |o: Outcome| done.send(o).unwrap()))
    }

    fn write_with_reply(payload: Vec<u8>, reply_len: usize, timeout: Option<Duration>,
        done: mpsc::Sender<Outcome>) -> Job
    {
        Job::new(Operation::Write {
                characteristic: uuid(),
                chunks: crate::central::frame::split(&payload, 20),
                response: Some(FrameSpec {
                    max_frame_size: 16,
                    whole_frame: Arc::new(move |b: &[u8]| b.len() >= reply_len),
                }),
            },
            timeout,
            "write and await reply".into(),
            Box::new(move |o: Outcome| done.send(o).unwrap()))
            .with_notifications(true)
    }

    fn changed(value: &[u8]) -> PeerSignal {
        PeerSignal::Changed { characteristic: uuid(), value: value.to_vec() }
    }

    fn write_requests(mock: &MockTransport, n: usize) -> Vec<(RequestId, Vec<u8>)> {
        mock.wait_for_calls(is_write, n, WAIT).unwrap().into_iter()
            .filter_map(|c| match c {
                Call::Write { request, value, .. } => Some((request, value)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn write_sends_chunks_and_waits_for_every_ack() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        let payload: Vec<u8> = (0..60).collect();
        w.submit(write(payload.clone(), 20, None, tx)).ok().unwrap();

        let writes = write_requests(&mock, 3);
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|(_, v)| v.len() <= 20));
        let sent: Vec<u8> = writes.iter().flat_map(|(_, v)| v.iter().cloned()).collect();
        assert_eq!(sent, payload);

        for (i, (request, _)) in writes.iter().enumerate() {
            assert!(rx.try_recv().is_err(), "completed after {} acks", i);
            w.signal(PeerSignal::Written { request: *request, result: Ok(()) });
        }
        assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Response::Written);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mock.calls().iter().filter(|c| is_write(c)).count(), 3);
        w.close();
    }

    #[test]
    fn write_failure_cancels_unsent_chunks() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(200));
        let (tx, rx) = mpsc::channel();
        w.submit(write(vec![0; 60], 20, None, tx)).ok().unwrap();

        let (request, _) = write_requests(&mock, 1).remove(0);
        w.signal(PeerSignal::Written {
            request,
            result: Err(Error::new(ErrorKind::Transport, "write failed: 128")),
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap_err().kind(), ErrorKind::Transport);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(mock.calls().iter().filter(|c| is_write(c)).count(), 1);
        w.close();
    }

    #[test]
    fn write_timeout_cancels_unsent_chunks() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(200));
        let (tx, rx) = mpsc::channel();
        w.submit(write(vec![0; 60], 20, Some(Duration::from_millis(50)), tx)).ok().unwrap();

        assert!(rx.recv_timeout(WAIT).unwrap().unwrap_err().is_timeout());
        thread::sleep(Duration::from_millis(300));
        assert_eq!(mock.calls().iter().filter(|c| is_write(c)).count(), 1);
        w.close();
    }

    #[test]
    fn write_completes_with_reply() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(1));
        let (tx, rx) = mpsc::channel();
        w.submit(write_with_reply(vec![0; 30], 4, None, tx)).ok().unwrap();

        let writes = write_requests(&mock, 2);
        assert_eq!(mock.calls()[0],
            Call::SetNotify { handle: HANDLE, characteristic: uuid(), enabled: true });
        // The reply may overtake the last acknowledgement.
        w.signal(changed(&hex!("aabb")));
        w.signal(PeerSignal::Written { request: writes[0].0, result: Ok(()) });
        w.signal(changed(&hex!("ccdd")));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        w.signal(PeerSignal::Written { request: writes[1].0, result: Ok(()) });
        assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Response::Read(hex!("aabbccdd").to_vec()));
        w.close();
    }

    #[test]
    fn write_without_whole_reply_times_out() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(write_with_reply(vec![1], 4, Some(Duration::from_millis(100)), tx)).ok().unwrap();

        let (request, _) = write_requests(&mock, 1).remove(0);
        w.signal(PeerSignal::Written { request, result: Ok(()) });
        w.signal(changed(&[1]));
        assert!(rx.recv_timeout(WAIT).unwrap().unwrap_err().is_timeout());
        w.close();
    }

    #[test]
    fn oversized_reply_fails_write() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(write_with_reply(vec![1], 100, None, tx)).ok().unwrap();

        write_requests(&mock, 1);
        w.signal(changed(&[0; 10]));
        w.signal(changed(&[0; 10]));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap_err().kind(), ErrorKind::FrameOverflow);
        w.close();
    }

    #[test]
    fn transfer_unit() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(Job::new(Operation::SetTransferUnit { size: 185 }, None, "mtu".into(),
            Box::new(move |o: Outcome| tx.send(o).unwrap()))).ok().unwrap();

        let request = mock.wait_for_calls(|c| match c {
                Call::NegotiateTransferUnit { size: 185, .. } => true,
                _ => false,
            }, 1, WAIT).unwrap().into_iter()
            .filter_map(|c| match c {
                Call::NegotiateTransferUnit { request, .. } => Some(request),
                _ => None,
            })
            .next().unwrap();
        w.signal(PeerSignal::TransferUnit { request, result: Ok(185) });
        assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Response::TransferUnit(185));
        w.close();
    }

    #[test]
    fn transfer_unit_unsupported() {
        let mock = MockTransport::scripted().without_transfer_unit();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        w.submit(Job::new(Operation::SetTransferUnit { size: 185 }, None, "mtu".into(),
            Box::new(move |o: Outcome| tx.send(o).unwrap()))).ok().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap_err().kind(),
            ErrorKind::OperationNotSupported);
        w.close();
    }

    #[test]
    fn close_fails_in_flight_and_queued() {
        let mock = MockTransport::scripted();
        let w = worker(&mock, Duration::from_millis(0));
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            w.submit(read(None, any(), tx.clone(), i)).ok().unwrap();
        }
        read_requests(&mock, 1);
        w.close();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (id, outcome) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(outcome.unwrap_err().kind(), ErrorKind::ConnectionClosed);
            ids.push(id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
