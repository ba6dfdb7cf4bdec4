use log::{debug, warn};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::io;
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    NewJob(Job),
    Terminate,
}

struct Worker {
    sender: mpsc::Sender<Message>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(name: String) -> io::Result<Worker> {
        let (sender, receiver) = mpsc::channel::<Message>();
        let thread = thread::Builder::new()
            .name(name)
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                while let Ok(Message::NewJob(job)) = receiver.recv() {
                    job();
                }
            })?;
        Ok(Worker { sender, thread: Some(thread) })
    }

    fn stop(mut self) {
        let _ = self.sender.send(Message::Terminate);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Executor worker panicked");
            }
        }
    }
}

/// Serial executor per key.
///
/// Every key gets its own worker thread, created on first use, so jobs for
/// one key run in submission order while different keys never wait on each
/// other. The number of threads equals the number of distinct live keys.
pub struct KeyedExecutor<K> {
    name: String,
    workers: Mutex<HashMap<K, Worker>>,
}

impl<K> KeyedExecutor<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(name: impl Into<String>) -> Self {
        KeyedExecutor { name: name.into(), workers: Mutex::new(HashMap::new()) }
    }

    /// Queue `f` behind earlier jobs for `key`.
    pub fn execute<F>(&self, key: K, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut message = Message::NewJob(Box::new(f));
        // A worker whose job panicked has hung up; replace it once.
        for _ in 0..2 {
            if !workers.contains_key(&key) {
                workers.insert(key.clone(), Worker::spawn(format!("{}-{:?}", self.name, key))?);
                debug!("Started {} worker for {:?}", self.name, key);
            }
            let Some(worker) = workers.get(&key) else { break };
            match worker.sender.send(message) {
                Ok(()) => return Ok(()),
                Err(mpsc::SendError(returned)) => {
                    message = returned;
                    workers.remove(&key);
                }
            }
        }
        Err(io::Error::other(format!("{} worker for {:?} is not accepting jobs", self.name, key)))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stops the worker for `key` after its queued jobs have run.
    pub fn remove(&self, key: &K) {
        let worker = self.workers.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        if let Some(worker) = worker {
            worker.stop();
        }
    }

    /// Drains every queue and joins all workers.
    pub fn shutdown(&self) {
        let workers: Vec<Worker> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, w)| w)
            .collect();
        for worker in workers {
            worker.stop();
        }
    }
}

impl<K> Drop for KeyedExecutor<K> {
    fn drop(&mut self) {
        let workers = self.workers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, worker) in workers.drain() {
            worker.stop();
        }
    }
}
