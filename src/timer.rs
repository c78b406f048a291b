use futures_util::Stream;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::time::{self, Instant, Sleep};

#[derive(Clone, Copy, Debug, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) struct Timeout {
    deadline: Instant,
    id: u64,
}

/// Queue of cancellable timeouts, yielding the scheduled values as a stream in deadline order.
pub(crate) struct Timer<T> {
    next_id: u64,
    current: Option<CurrentTimerEntry<T>>,
    queue: BTreeMap<Timeout, T>,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            current: None,
            queue: BTreeMap::new(),
        }
    }

    /// Has the timer no scheduled timeouts?
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    #[cfg(test)]
    pub fn schedule_in(&mut self, deadline: std::time::Duration, value: T) -> Timeout {
        self.schedule_at(Instant::now() + deadline, value)
    }

    pub fn schedule_at(&mut self, deadline: Instant, value: T) -> Timeout {
        // If the current timeout is later than the new one, push it back into the queue.
        if let Some(current) = self.current.take() {
            let key = current.key();

            if deadline < key.deadline {
                self.queue.insert(key, current.value);
            } else {
                self.current = Some(current);
            }
        }

        let id = self.next_id();
        let key = Timeout { deadline, id };
        self.queue.insert(key, value);

        key
    }

    pub fn cancel(&mut self, timeout: Timeout) -> bool {
        if let Some(current) = &self.current {
            if current.key() == timeout {
                self.current = None;
                return true;
            }
        }

        self.queue.remove(&timeout).is_some()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

impl<T: Unpin> Stream for Timer<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(current) = &mut self.current {
                match current.sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        return Poll::Ready(self.current.take().map(|entry| entry.value));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            let (key, value) = match self.queue.pop_first() {
                Some(entry) => entry,
                None => return Poll::Ready(None),
            };

            self.current = Some(CurrentTimerEntry {
                sleep: Box::pin(time::sleep_until(key.deadline)),
                value,
                id: key.id,
            });
        }
    }
}

struct CurrentTimerEntry<T> {
    sleep: Pin<Box<Sleep>>,
    value: T,
    id: u64,
}

impl<T> CurrentTimerEntry<T> {
    fn key(&self) -> Timeout {
        Timeout {
            deadline: self.sleep.deadline(),
            id: self.id,
        }
    }
}
