//! Spawns dedicated OS threads each hosting one `EventLoop`, and hands out
//! `LoopHandle`s round-robin for new connections to be dispatched onto.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::trace;

use crate::event_loop::{EventLoop, LoopHandle};

/// Invoked once on a worker thread immediately after its `EventLoop` is
/// constructed, before `EventLoop::run` starts — the place to attach
/// thread-local setup.
pub type ThreadInitCallback = Box<dyn Fn(&LoopHandle) + Send + Sync>;

/// A single named worker thread hosting exactly one `EventLoop`.
pub(crate) struct LoopThread {
    join_handle: Option<JoinHandle<()>>,
    loop_: LoopHandle,
}

impl LoopThread {
    /// Spawns the worker thread, blocks until its `EventLoop` has been
    /// constructed (the channel handoff stands in for a semaphore wait),
    /// runs `init_cb` on the worker thread, then starts `EventLoop::run`.
    pub(crate) fn start(name: String, init_cb: Option<Arc<ThreadInitCallback>>) -> LoopThread {
        let (tx, rx) = mpsc::channel::<LoopHandle>();

        let join_handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let loop_ = match EventLoop::new() {
                    Ok(loop_) => loop_,
                    Err(e) => {
                        log::error!("failed to create EventLoop on thread {name}: {e}");
                        return;
                    }
                };
                if let Some(cb) = &init_cb {
                    cb(&loop_);
                }
                tx.send(loop_.clone()).expect("loop thread pool dropped before handoff");
                loop_.run();
            })
            .expect("failed to spawn loop thread");

        let loop_ = rx.recv().expect("loop thread exited before publishing its EventLoop");
        LoopThread {
            join_handle: Some(join_handle),
            loop_,
        }
    }

    pub(crate) fn loop_handle(&self) -> LoopHandle {
        self.loop_.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.loop_.quit();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

/// A fixed pool of worker loops, filled in round-robin as connections are
/// accepted by the main/accept loop.
pub(crate) struct LoopThreadPool {
    base_loop: LoopHandle,
    name: String,
    threads: Vec<LoopThread>,
    next: std::cell::Cell<usize>,
}

impl LoopThreadPool {
    pub(crate) fn new(base_loop: LoopHandle, name: String) -> LoopThreadPool {
        LoopThreadPool {
            base_loop,
            name,
            threads: Vec::new(),
            next: std::cell::Cell::new(0),
        }
    }

    /// Spawns `num_threads` worker loops. `num_threads == 0` is the valid
    /// "single-loop" configuration: every connection stays on the base
    /// loop and no worker threads are created.
    pub(crate) fn start(&mut self, num_threads: usize, init_cb: Option<ThreadInitCallback>) {
        assert!(self.threads.is_empty(), "LoopThreadPool::start called twice");
        let init_cb = init_cb.map(Arc::new);

        for i in 0..num_threads {
            let thread_name = format!("{}-{}", self.name, i);
            trace!("starting worker loop thread {thread_name}");
            self.threads.push(LoopThread::start(thread_name, init_cb.clone()));
        }

        if num_threads == 0 {
            if let Some(cb) = init_cb {
                cb(&self.base_loop);
            }
        }
    }

    /// Returns the next loop to hand a connection to, round-robin. Falls
    /// back to the base loop when no worker threads were started.
    pub(crate) fn get_next_loop(&self) -> LoopHandle {
        if self.threads.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.get();
        self.next.set((i + 1) % self.threads.len());
        self.threads[i].loop_handle()
    }

    #[allow(dead_code)]
    pub(crate) fn get_all_loops(&self) -> Vec<LoopHandle> {
        if self.threads.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.threads.iter().map(LoopThread::loop_handle).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_keeps_everything_on_base_loop() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base.clone(), "test".to_string());
        pool.start(0, None);
        assert!(Arc::ptr_eq(&pool.get_next_loop(), &base));
    }

    #[test]
    fn round_robins_across_worker_threads() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base, "test".to_string());
        pool.start(2, None);

        let a = pool.get_next_loop();
        let b = pool.get_next_loop();
        let c = pool.get_next_loop();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }
}
