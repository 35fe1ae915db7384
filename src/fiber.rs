//! Fibers: cooperative tasks that borrow a host worker's thread one
//! message at a time, without ever blocking that thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use log::error;

use crate::channel::{Channel, Listener};
use crate::error::Error;
use crate::message::Message;
use crate::worker::{Handler, Worker};

thread_local! {
    static CURRENT: RefCell<Option<Fiber>> = RefCell::new(None);
}

struct CurrentGuard(Option<Fiber>);

impl CurrentGuard {
    fn set(fiber: Fiber) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(fiber));
        Self(previous)
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.0.take());
    }
}

struct State {
    alive: bool,
    pending: VecDeque<Message>,
    handler: Option<Box<dyn FnMut(Message) + Send>>,
    // kept alive here so the mailbox's weak reference to it stays
    // resolvable for as long as the fiber itself is alive
    bridge: Option<Arc<Bridge>>,
}

struct Inner {
    host: Worker,
    mailbox: Channel,
    state: Mutex<State>,
}

/// A cooperative task scheduled on a host [`Worker`].
///
/// A fiber never owns an OS thread; it is woken by its host worker one
/// message at a time through a bridge listener registered on its own
/// private mailbox.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

struct Bridge {
    fiber: Weak<Inner>,
}

impl Listener for Bridge {
    fn send(&self, msg: Message) -> Result<(), Message> {
        let inner = match self.fiber.upgrade() {
            Some(inner) => inner,
            None => return Err(msg),
        };
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.alive {
            return Err(msg);
        }
        state.pending.push_back(msg);
        drop(state);
        Fiber::schedule_dispatch(inner);
        Ok(())
    }

    fn alive(&self) -> bool {
        match self.fiber.upgrade() {
            Some(inner) => inner.state.lock().unwrap_or_else(|e| e.into_inner()).alive,
            None => false,
        }
    }
}

impl Fiber {
    /// Creates a fiber hosted on `host`, constructing `factory()` on
    /// the host thread.
    ///
    /// If `host` is already closed, the fiber's mailbox is closed
    /// immediately and the fiber is constructed dead: there is no
    /// thread left to run the initializer on.
    pub fn make<H, F>(host: Worker, factory: F) -> Fiber
    where
        H: Handler + 'static,
        F: FnOnce() -> H + Send + 'static,
    {
        let mailbox = Channel::make();
        let inner = Arc::new(Inner {
            host: host.clone(),
            mailbox: mailbox.clone(),
            state: Mutex::new(State {
                alive: true,
                pending: VecDeque::new(),
                handler: None,
                bridge: None,
            }),
        });

        if !host.alive() {
            inner.state.lock().unwrap_or_else(|e| e.into_inner()).alive = false;
            mailbox.close(false);
            return Fiber { inner };
        }

        let init_inner = inner.clone();
        host.schedule(move || {
            let mut handler = factory();
            let recv_fn = move |msg: Message| handler.recv(msg);

            let bridge = Arc::new(Bridge {
                fiber: Arc::downgrade(&init_inner),
            });
            let weak: Weak<dyn Listener> = Arc::downgrade(&bridge);

            {
                let mut state = init_inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.handler = Some(Box::new(recv_fn));
                state.bridge = Some(bridge);
            }
            init_inner.mailbox.register_listener(weak, true);
        });

        Fiber { inner }
    }

    fn schedule_dispatch(inner: Arc<Inner>) {
        let host = inner.host.clone();
        host.schedule(move || Fiber::dispatch(inner));
    }

    /// Pops one pending message and runs the handler on it; re-arms
    /// itself on the host if more messages remain, so no fiber starves
    /// its siblings by draining its whole backlog in one turn.
    fn dispatch(inner: Arc<Inner>) {
        let _guard = CurrentGuard::set(Fiber {
            inner: inner.clone(),
        });

        let msg = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let msg = state.pending.pop_front();
            if msg.is_some() && !state.pending.is_empty() {
                drop(state);
                Fiber::schedule_dispatch(inner.clone());
            }
            msg
        };
        let msg = match msg {
            Some(msg) => msg,
            None => return,
        };

        let handler = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.handler.take()
        };
        if let Some(mut handler) = handler {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(msg))) {
                error!("fiber: {}", Error::handler_panic(payload));
            }
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.handler = Some(handler);
        }
    }

    /// The fiber currently dispatching on the calling OS thread, if
    /// any.
    pub fn current() -> Option<Fiber> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// The worker this fiber was created on. Fixed for the fiber's
    /// whole lifetime: fibers never migrate between hosts.
    pub fn parent(&self) -> Worker {
        self.inner.host.clone()
    }

    pub fn send<T: std::any::Any + Send>(&self, id: usize, value: T) -> bool {
        self.inner.mailbox.send(id, value)
    }

    pub fn send_id(&self, id: usize) -> bool {
        self.inner.mailbox.send_id(id)
    }

    pub fn queued(&self) -> usize {
        self.inner.mailbox.queued()
    }

    pub fn alive(&self) -> bool {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).alive
    }

    /// Closes the fiber's mailbox. Idempotent.
    pub fn close(&self, soft: bool) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.alive {
            return;
        }
        state.alive = false;
        if !soft {
            state.pending.clear();
        }
        drop(state);
        self.inner.mailbox.close(soft);
    }
}
