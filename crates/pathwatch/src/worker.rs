//! Worker base: thread lifecycle, command dispatch, queue plumbing.
//!
//! A [`Worker`] pairs an inbound and an outbound [`MessageQueue`] with one
//! OS thread that exclusively drives a [`WorkerStrategy`]. The base owns
//! the loop (drain commands, dispatch, do one unit of work, publish, park)
//! and the strategy owns the domain state and decides what each command
//! means.
//!
//! A worker with nothing to do is logically offline (state `Stopped`, no
//! thread). Commands submitted then are serviced synchronously on the
//! submitting thread; a command that needs the thread (an add) is buffered
//! onto the inbound queue and the thread is started.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};

use crate::error::{Result, WatcherError};
use crate::logging;
use crate::logline;
use crate::message::{CommandAction, CommandPayload, Message};
use crate::queue::MessageQueue;
use crate::status::WorkerHealth;

/// Lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    fn load(state: &AtomicU8) -> WorkerState {
        match state.load(Ordering::SeqCst) {
            0 => Self::Stopped,
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Stopping,
        }
    }
}

/// What the loop should do after one command is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Handled; the acknowledgement is deferred or not wanted.
    Nothing,
    /// Handled; acknowledge now.
    Ack,
    /// Only meaningful offline; treated as a plain ack while running.
    TriggerRun,
    /// Acknowledge, flush, and stop the thread.
    TriggerStop,
}

/// Outcome of a command serviced while the worker thread is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineCommandOutcome {
    /// Fully serviced on the submitting thread; acknowledge now.
    Ack,
    /// Needs the worker thread: buffer the command and start it.
    TriggerRun,
    /// Nothing left to stop; acknowledge now.
    TriggerStop,
}

/// Hooks the worker body dispatches into.
///
/// The channel-lifecycle hooks receive the outgoing buffer because they may
/// owe messages beyond their own ack: removing a root whose add is still
/// being serviced settles that add's deferred ack on the spot.
pub trait WorkerStrategy: Send + 'static {
    /// Begin watching. Receives the whole command so a deferred ack can
    /// reuse its id.
    fn handle_add(
        &mut self,
        command: &CommandPayload,
        outgoing: &mut Vec<Message>,
    ) -> Result<CommandOutcome>;

    /// Stop watching one channel.
    fn handle_remove(
        &mut self,
        command: &CommandPayload,
        outgoing: &mut Vec<Message>,
    ) -> Result<CommandOutcome>;

    /// Numeric reconfiguration (polling interval, throttle budget).
    fn handle_config(&mut self, command: &CommandPayload) -> Result<CommandOutcome>;

    /// A non-log command arriving while the thread is offline. The default
    /// buffers adds for the thread and services everything else in place.
    fn handle_offline_command(
        &mut self,
        command: &CommandPayload,
        _outgoing: &mut Vec<Message>,
    ) -> Result<OfflineCommandOutcome> {
        match command.action {
            CommandAction::Add { .. } => Ok(OfflineCommandOutcome::TriggerRun),
            _ => Ok(OfflineCommandOutcome::Ack),
        }
    }

    /// One unit of work between command drains. Emitted messages are
    /// published to the outbound queue when the call returns.
    fn work(&mut self, buffer: &mut Vec<Message>) -> Result<()>;

    /// How long to park before the next iteration when no wake signal
    /// arrives first.
    fn pause(&self) -> Duration;
}

// ---------------------------------------------------------------------------
// Shared worker state
// ---------------------------------------------------------------------------

struct WorkerShared {
    name: &'static str,
    state: AtomicU8,
    error: Mutex<Option<String>>,
    inbound: MessageQueue,
    outbound: MessageQueue,
    notifier: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl WorkerShared {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(WorkerState::Stopped as u8),
            error: Mutex::new(None),
            inbound: MessageQueue::new(),
            outbound: MessageQueue::new(),
            notifier: Mutex::new(None),
        }
    }

    fn state(&self) -> WorkerState {
        WorkerState::load(&self.state)
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn latch_error(&self, message: String) {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(message);
            }
        }
    }

    fn clear_error(&self) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = None;
        }
    }

    /// Appends a batch to the outbound queue and tells the host about it.
    fn publish(&self, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        self.outbound.enqueue_all(batch);
        let notify = self
            .notifier
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(notify) = notify {
            notify();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker, the host-side handle
// ---------------------------------------------------------------------------

/// Host-side handle for one worker thread and its queues.
pub struct Worker<S: WorkerStrategy> {
    shared: Arc<WorkerShared>,
    strategy: Arc<Mutex<S>>,
    wake_tx: Mutex<Option<Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkerStrategy> Worker<S> {
    pub fn new(name: &'static str, strategy: S) -> Self {
        Self {
            shared: Arc::new(WorkerShared::new(name)),
            strategy: Arc::new(Mutex::new(strategy)),
            wake_tx: Mutex::new(None),
            join: Mutex::new(None),
        }
    }

    /// Registers the callback fired whenever new outbound messages are
    /// published. The callback runs on the worker thread; it must not call
    /// back into [`Worker::stop`].
    pub fn set_notifier(&self, notify: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.notifier.lock() {
            *slot = Some(Arc::new(notify));
        }
    }

    /// Submits a batch of command messages. A running worker is signalled
    /// to pick them up; an offline worker services them on the calling
    /// thread, buffering the ones that need the thread and starting it.
    pub fn send(&self, batch: Vec<Message>) -> Result<()> {
        match self.shared.state() {
            WorkerState::Stopped | WorkerState::Stopping => {
                self.join_thread();
                self.send_offline(batch)
            }
            WorkerState::Starting | WorkerState::Running => {
                self.shared.inbound.enqueue_all(batch);
                self.signal();
                Ok(())
            }
        }
    }

    /// Asks the thread to finish its current iteration and waits for it.
    pub fn stop(&self) {
        if matches!(
            self.shared.state(),
            WorkerState::Starting | WorkerState::Running
        ) {
            self.shared.set_state(WorkerState::Stopping);
            self.signal();
        }
        self.join_thread();
    }

    pub fn state_name(&self) -> &'static str {
        self.shared.state().as_str()
    }

    /// The latched fatal error of the last run, if any.
    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().ok().and_then(|slot| slot.clone())
    }

    /// Drains the outbound queue.
    pub fn take_outbound(&self) -> Vec<Message> {
        self.shared.outbound.accept_all()
    }

    pub fn collect_status(&self) -> WorkerHealth {
        WorkerHealth {
            state: self.state_name().to_string(),
            error: self.error(),
            inbound_size: self.shared.inbound.len(),
            inbound_error: self.shared.inbound.error(),
            outbound_size: self.shared.outbound.len(),
            outbound_error: self.shared.outbound.error(),
        }
    }

    /// Spawns the thread if the worker is stopped. The `Stopped → Starting`
    /// transition decides ownership, so concurrent callers spawn once.
    fn start(&self) {
        if !self
            .shared
            .transition(WorkerState::Stopped, WorkerState::Starting)
        {
            return;
        }
        self.join_thread();
        self.shared.clear_error();

        let (wake_tx, wake_rx) = channel::unbounded::<()>();
        if let Ok(mut slot) = self.wake_tx.lock() {
            *slot = Some(wake_tx);
        }

        let shared = self.shared.clone();
        let strategy = self.strategy.clone();
        let handle = thread::spawn(move || run_worker(shared, strategy, wake_rx));
        if let Ok(mut slot) = self.join.lock() {
            *slot = Some(handle);
        }
    }

    fn send_offline(&self, batch: Vec<Message>) -> Result<()> {
        let mut acks = Vec::new();
        let mut deferred = Vec::new();

        {
            let mut strategy = self
                .strategy
                .lock()
                .map_err(|_| WatcherError::Worker("worker strategy lock poisoned".to_string()))?;

            for message in batch {
                let Message::Command(command) = message else {
                    continue;
                };
                // Once one command needs the thread, everything behind it
                // follows it onto the inbound queue so the batch keeps its
                // submission order.
                if !deferred.is_empty() {
                    deferred.push(Message::Command(command));
                    continue;
                }
                logline!("{} handling offline: {command}", self.shared.name);
                match offline_dispatch(&mut *strategy, &command, &mut acks) {
                    Ok(OfflineCommandOutcome::Ack) | Ok(OfflineCommandOutcome::TriggerStop) => {
                        acks.push(Message::ack_for(&command, &Ok(())));
                    }
                    Ok(OfflineCommandOutcome::TriggerRun) => {
                        deferred.push(Message::Command(command));
                    }
                    Err(error) => {
                        logline!("{} offline command failed: {error}", self.shared.name);
                        acks.push(Message::ack_for(&command, &Err(error)));
                    }
                }
            }
        }

        self.shared.publish(acks);

        if !deferred.is_empty() {
            self.shared.inbound.enqueue_all(deferred);
            self.start();
        }
        Ok(())
    }

    fn signal(&self) {
        let sender = self.wake_tx.lock().ok().and_then(|slot| slot.clone());
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn join_thread(&self) {
        let handle = self.join.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl<S: WorkerStrategy> Drop for Worker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Worker thread body
// ---------------------------------------------------------------------------

fn run_worker<S: WorkerStrategy>(
    shared: Arc<WorkerShared>,
    strategy: Arc<Mutex<S>>,
    wake_rx: Receiver<()>,
) {
    // A stop() issued between spawn and here wins; the loop below sees
    // Stopping on its first iteration and exits cleanly.
    shared.transition(WorkerState::Starting, WorkerState::Running);
    logline!("{} started", shared.name);

    loop {
        let mut outgoing: Vec<Message> = Vec::new();
        let mut stop = false;
        let pause;

        {
            let mut strategy = match strategy.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    shared.latch_error("worker strategy lock poisoned".to_string());
                    break;
                }
            };

            // Handle commands.
            for message in shared.inbound.accept_all() {
                let Message::Command(command) = message else {
                    continue;
                };
                logline!("{} handling: {command}", shared.name);
                match dispatch_command(&mut *strategy, &command, &mut outgoing) {
                    Ok(CommandOutcome::Nothing) => {}
                    Ok(CommandOutcome::Ack) | Ok(CommandOutcome::TriggerRun) => {
                        outgoing.push(Message::ack_for(&command, &Ok(())));
                    }
                    Ok(CommandOutcome::TriggerStop) => {
                        outgoing.push(Message::ack_for(&command, &Ok(())));
                        stop = true;
                    }
                    Err(error) => {
                        logline!("{} command failed: {error}", shared.name);
                        outgoing.push(Message::ack_for(&command, &Err(error)));
                    }
                }
            }

            if stop || shared.state() == WorkerState::Stopping {
                logline!("{} stopping", shared.name);
                shared.publish(outgoing);
                break;
            }

            if let Err(error) = strategy.work(&mut outgoing) {
                logline!("{} body failed: {error}", shared.name);
                shared.publish(outgoing);
                shared.latch_error(error.to_string());
                break;
            }

            pause = strategy.pause();
        }

        shared.publish(outgoing);

        match wake_rx.recv_timeout(pause) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    shared.set_state(WorkerState::Stopped);
    logline!("{} stopped", shared.name);
}

fn dispatch_command<S: WorkerStrategy>(
    strategy: &mut S,
    command: &CommandPayload,
    outgoing: &mut Vec<Message>,
) -> Result<CommandOutcome> {
    match &command.action {
        CommandAction::Add { .. } => strategy.handle_add(command, outgoing),
        CommandAction::Remove { .. } => strategy.handle_remove(command, outgoing),
        CommandAction::PollingInterval(_) | CommandAction::PollingThrottle(_) => {
            strategy.handle_config(command)
        }
        CommandAction::LogToFile(_)
        | CommandAction::LogToStderr
        | CommandAction::LogToStdout
        | CommandAction::LogDisable => {
            apply_log_command(&command.action).map(|()| CommandOutcome::Ack)
        }
        // The ack rides the outbound queue behind everything already
        // emitted, which is the flush the host is waiting for.
        CommandAction::Drain => Ok(CommandOutcome::Ack),
    }
}

fn offline_dispatch<S: WorkerStrategy>(
    strategy: &mut S,
    command: &CommandPayload,
    outgoing: &mut Vec<Message>,
) -> Result<OfflineCommandOutcome> {
    match &command.action {
        CommandAction::LogToFile(_)
        | CommandAction::LogToStderr
        | CommandAction::LogToStdout
        | CommandAction::LogDisable => {
            apply_log_command(&command.action)?;
            Ok(OfflineCommandOutcome::Ack)
        }
        CommandAction::Drain => Ok(OfflineCommandOutcome::Ack),
        _ => strategy.handle_offline_command(command, outgoing),
    }
}

/// Reconfigures the logger of whichever thread runs this: the worker
/// thread for queued commands, the submitting thread for offline ones.
fn apply_log_command(action: &CommandAction) -> Result<()> {
    match action {
        CommandAction::LogToFile(path) => logging::to_file(path),
        CommandAction::LogToStderr => {
            logging::to_stderr();
            Ok(())
        }
        CommandAction::LogToStdout => {
            logging::to_stdout();
            Ok(())
        }
        CommandAction::LogDisable => {
            logging::disable();
            Ok(())
        }
        _ => Err(WatcherError::UnsupportedCommand(format!(
            "not a log command: {action}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NULL_CHANNEL_ID;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct TestStrategy {
        work_calls: Arc<AtomicUsize>,
        fail_add: bool,
        fail_work: bool,
    }

    impl TestStrategy {
        fn new(work_calls: Arc<AtomicUsize>) -> Self {
            Self {
                work_calls,
                fail_add: false,
                fail_work: false,
            }
        }
    }

    impl WorkerStrategy for TestStrategy {
        fn handle_add(
            &mut self,
            _command: &CommandPayload,
            _outgoing: &mut Vec<Message>,
        ) -> Result<CommandOutcome> {
            if self.fail_add {
                return Err(WatcherError::InvalidRoot("not today".to_string()));
            }
            Ok(CommandOutcome::Ack)
        }

        fn handle_remove(
            &mut self,
            _command: &CommandPayload,
            _outgoing: &mut Vec<Message>,
        ) -> Result<CommandOutcome> {
            Ok(CommandOutcome::TriggerStop)
        }

        fn handle_config(&mut self, _command: &CommandPayload) -> Result<CommandOutcome> {
            Ok(CommandOutcome::Ack)
        }

        fn work(&mut self, _buffer: &mut Vec<Message>) -> Result<()> {
            self.work_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_work {
                return Err(WatcherError::Worker("work exploded".to_string()));
            }
            Ok(())
        }

        fn pause(&self) -> Duration {
            Duration::from_millis(5)
        }
    }

    fn add_command(id: u32) -> Message {
        Message::Command(CommandPayload::new(
            id,
            CommandAction::Add {
                root: PathBuf::from("/"),
                channel: 1,
                split_count: 1,
            },
        ))
    }

    fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn offline_log_command_is_acked_without_starting_the_thread() {
        let work_calls = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new("test worker", TestStrategy::new(work_calls.clone()));

        worker
            .send(vec![Message::Command(CommandPayload::new(
                5,
                CommandAction::LogDisable,
            ))])
            .unwrap();

        assert_eq!(worker.state_name(), "stopped");
        assert_eq!(work_calls.load(Ordering::SeqCst), 0);

        let out = worker.take_outbound();
        assert_eq!(out.len(), 1);
        let ack = out[0].as_ack().unwrap();
        assert_eq!(ack.key, 5);
        assert_eq!(ack.channel, NULL_CHANNEL_ID);
        assert!(ack.success);
    }

    #[test]
    fn offline_add_starts_the_thread_and_runs_work() {
        let work_calls = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new("test worker", TestStrategy::new(work_calls.clone()));

        worker.send(vec![add_command(1)]).unwrap();

        assert!(wait_until(|| work_calls.load(Ordering::SeqCst) > 0));
        assert_eq!(worker.state_name(), "running");
        assert!(wait_until(|| worker
            .take_outbound()
            .iter()
            .any(|message| message.as_ack().map(|ack| ack.key) == Some(1))));

        worker.stop();
        assert_eq!(worker.state_name(), "stopped");
    }

    #[test]
    fn trigger_stop_outcome_stops_the_thread() {
        let work_calls = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new("test worker", TestStrategy::new(work_calls.clone()));

        worker.send(vec![add_command(1)]).unwrap();
        assert!(wait_until(|| work_calls.load(Ordering::SeqCst) > 0));

        worker
            .send(vec![Message::Command(CommandPayload::new(
                2,
                CommandAction::Remove { channel: 1 },
            ))])
            .unwrap();

        assert!(wait_until(|| worker.state_name() == "stopped"));

        let out = worker.take_outbound();
        assert!(out
            .iter()
            .any(|message| message.as_ack().map(|ack| (ack.key, ack.success)) == Some((2, true))));
    }

    #[test]
    fn failing_command_acks_failure_and_the_worker_survives() {
        let work_calls = Arc::new(AtomicUsize::new(0));
        let mut strategy = TestStrategy::new(work_calls.clone());
        strategy.fail_add = true;
        let worker = Worker::new("test worker", strategy);

        worker.send(vec![add_command(7)]).unwrap();

        assert!(wait_until(|| worker
            .take_outbound()
            .iter()
            .any(|message| message.as_ack().map(|ack| (ack.key, ack.success))
                == Some((7, false)))));

        // The add failed but the thread is up and doing work.
        assert!(wait_until(|| work_calls.load(Ordering::SeqCst) > 0));
        assert_eq!(worker.state_name(), "running");

        worker.stop();
    }

    #[test]
    fn fatal_work_error_is_latched_and_stops_the_thread() {
        let work_calls = Arc::new(AtomicUsize::new(0));
        let mut strategy = TestStrategy::new(work_calls.clone());
        strategy.fail_work = true;
        let worker = Worker::new("test worker", strategy);

        worker.send(vec![add_command(1)]).unwrap();

        assert!(wait_until(|| worker.state_name() == "stopped"));
        assert!(worker.error().unwrap().contains("work exploded"));
    }

    #[test]
    fn status_reports_queue_sizes() {
        let work_calls = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new("test worker", TestStrategy::new(work_calls));

        worker
            .send(vec![Message::Command(CommandPayload::new(
                3,
                CommandAction::LogDisable,
            ))])
            .unwrap();

        let health = worker.collect_status();
        assert_eq!(health.state, "stopped");
        assert_eq!(health.inbound_size, 0);
        assert_eq!(health.outbound_size, 1);
        assert!(health.error.is_none());
        assert!(health.inbound_error.is_none());
        assert!(health.outbound_error.is_none());
    }
}
