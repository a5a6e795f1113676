use std::sync::mpsc as std_mpsc;
use std::thread::ThreadId;

/// A task submitted for execution on the dedicated consumer thread. Boxed so
/// the channel can carry heterogeneous closures.
type Task = Box<dyn FnOnce() + Send>;

/// Pins all calls into the Kafka client to a single, dedicated worker thread,
/// per `spec.md` §4.1: the client is not thread-safe, so every
/// consumer-thread-annotated operation in the event loop must run here.
///
/// Other threads interact with consumer-thread state only via: atomic flag
/// mutations, submitting tasks through [`ConsumerThreadHandle`], and the
/// bounded records channel — never by calling into the Kafka client directly.
pub struct ConsumerThread {
    handle: Option<std::thread::JoinHandle<()>>,
    thread_id: ThreadId,
}

/// A cheaply cloneable handle used to submit work onto the consumer thread
/// from any other thread or async task.
#[derive(Clone)]
pub struct ConsumerThreadHandle {
    tasks: std_mpsc::Sender<Task>,
    thread_id: ThreadId,
}

impl ConsumerThread {
    /// Spawns the worker thread, named `kafka-{group_id}-0` per `spec.md`
    /// §4.1 so the identity can be asserted against in debug builds.
    pub fn spawn(group_id: &str) -> (Self, ConsumerThreadHandle) {
        let (tx, rx) = std_mpsc::channel::<Task>();
        let name = format!("kafka-{group_id}-0");

        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    // A panicking task must not poison the worker for every
                    // task after it; the thread affinity contract only
                    // promises serialized execution, not that a bad task
                    // brings the whole loop down.
                    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
                        tracing::error!("consumer thread task panicked: {:?}", panic_message(payload));
                    }
                }
            })
            .expect("failed to spawn consumer thread");

        let thread_id = handle.thread().id();

        (
            Self {
                handle: Some(handle),
                thread_id,
            },
            ConsumerThreadHandle { tasks: tx, thread_id },
        )
    }
}

impl Drop for ConsumerThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Dropping the handle's paired sender (held by every
            // `ConsumerThreadHandle`) is what actually stops the loop; this
            // join just waits for the in-flight task, if any, to finish.
            let _ = handle.join();
        }
    }
}

impl ConsumerThreadHandle {
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        if self.tasks.send(Box::new(task)).is_err() {
            tracing::warn!("consumer thread has shut down; dropping submitted task");
        }
    }

    /// Debug-only assertion that the calling thread is in fact the consumer
    /// thread, per `spec.md` §9's "Annotation for thread affinity" guidance.
    /// Compiles out entirely in release builds.
    #[inline]
    pub fn assert_on_consumer_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.thread_id,
            "called a consumer-thread-only operation from the wrong thread"
        );
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
