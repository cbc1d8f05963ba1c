use std::{collections::HashMap, time::Duration};

use tokio::{task::JoinHandle, time::Instant};

use crate::model::{ChatId, UserId};

/// Peers currently typing in the open conversation.
///
/// Entries are removed by `user_stopped_typing`, or dropped once they go
/// `expiry` without a fresh `user_typing` in case the stop never arrives.
#[derive(Debug)]
pub struct PeerTyping {
    expiry: Duration,
    peers: Vec<(UserId, Instant)>,
}

impl PeerTyping {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            peers: Vec::new(),
        }
    }

    /// Returns whether the visible set changed.
    pub fn start(&mut self, user_id: &UserId, now: Instant) -> bool {
        let pruned = self.prune(now);
        match self.peers.iter_mut().find(|(id, _)| id == user_id) {
            Some((_, seen)) => {
                *seen = now;
                pruned
            }
            None => {
                self.peers.push((user_id.clone(), now));
                true
            }
        }
    }

    pub fn stop(&mut self, user_id: &UserId, now: Instant) -> bool {
        let pruned = self.prune(now);
        let before = self.peers.len();
        self.peers.retain(|(id, _)| id != user_id);
        pruned || self.peers.len() != before
    }

    pub fn prune(&mut self, now: Instant) -> bool {
        let before = self.peers.len();
        let expiry = self.expiry;
        self.peers.retain(|(_, seen)| now.duration_since(*seen) < expiry);
        self.peers.len() != before
    }

    pub fn users(&mut self, now: Instant) -> Vec<UserId> {
        self.prune(now);
        self.peers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

/// One expiry timer per typing peer, so the set shrinks (and a notice goes
/// out) even when no further event arrives. Timers are aborted on drop.
#[derive(Debug, Default)]
pub(crate) struct PeerTimers(HashMap<UserId, JoinHandle<()>>);

impl PeerTimers {
    /// Replaces the peer's pending timer.
    pub(crate) fn arm(&mut self, user_id: &UserId, timer: JoinHandle<()>) {
        if let Some(previous) = self.0.insert(user_id.clone(), timer) {
            previous.abort();
        }
    }

    pub(crate) fn cancel(&mut self, user_id: &UserId) {
        if let Some(timer) = self.0.remove(user_id) {
            timer.abort();
        }
    }

    pub(crate) fn clear(&mut self) {
        for (_, timer) in self.0.drain() {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

impl Drop for PeerTimers {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Our own "is typing" flag and the debounce timer that clears it.
#[derive(Debug, Default)]
pub(crate) struct LocalTyping {
    typing_in: Option<ChatId>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

pub(crate) struct Keystroke {
    /// `typing_start` must go out for this chat.
    pub(crate) start: bool,
    /// A conversation we were typing in before and must send `typing_stop` for.
    pub(crate) abandoned: Option<ChatId>,
    /// Token the debounce timer has to present to [`LocalTyping::expire`].
    pub(crate) generation: u64,
}

impl LocalTyping {
    /// Records a keystroke in `chat_id` and cancels the pending debounce.
    pub(crate) fn keystroke(&mut self, chat_id: &ChatId) -> Keystroke {
        self.cancel_timer();
        let (start, abandoned) = match self.typing_in.replace(chat_id.clone()) {
            Some(previous) if &previous == chat_id => (false, None),
            Some(previous) => (true, Some(previous)),
            None => (true, None),
        };
        Keystroke {
            start,
            abandoned,
            generation: self.generation,
        }
    }

    pub(crate) fn arm(&mut self, timer: JoinHandle<()>) {
        self.timer = Some(timer);
    }

    /// Called by the debounce timer; only the latest timer may clear the flag.
    pub(crate) fn expire(&mut self, generation: u64) -> Option<ChatId> {
        if generation != self.generation {
            return None;
        }
        self.timer = None;
        self.generation += 1;
        self.typing_in.take()
    }

    /// Clears the flag right away (send, close, switch).
    pub(crate) fn stop(&mut self) -> Option<ChatId> {
        self.cancel_timer();
        self.typing_in.take()
    }

    pub(crate) fn is_typing(&self) -> bool {
        self.typing_in.is_some()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn peers_are_a_set() {
        let now = Instant::now();
        let mut typing = PeerTyping::new(Duration::from_secs(4));

        assert!(typing.start(&"b".into(), now));
        assert!(!typing.start(&"b".into(), now));
        assert!(typing.start(&"c".into(), now));
        assert_eq!(typing.users(now), vec![UserId::from("b"), UserId::from("c")]);

        assert!(typing.stop(&"b".into(), now));
        assert!(!typing.stop(&"b".into(), now));
        assert_eq!(typing.users(now), vec![UserId::from("c")]);
    }

    #[test]
    fn silent_peers_expire() {
        let now = Instant::now();
        let mut typing = PeerTyping::new(Duration::from_secs(4));
        typing.start(&"b".into(), now);
        typing.start(&"c".into(), now);

        let later = now + Duration::from_secs(3);
        typing.start(&"c".into(), later);

        assert_eq!(typing.users(now + Duration::from_secs(5)), vec![UserId::from("c")]);
        assert!(typing.users(later + Duration::from_secs(4)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_a_peer_aborts_its_old_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = |secs| {
            let fired = fired.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut timers = PeerTimers::default();

        timers.arm(&"b".into(), timer(1));
        timers.arm(&"b".into(), timer(2));
        timers.arm(&"c".into(), timer(3));
        assert_eq!(timers.len(), 2);
        timers.cancel(&"c".into());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        timers.arm(&"b".into(), timer(1));
        drop(timers);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keystrokes_only_start_once_per_chat() {
        let mut local = LocalTyping::default();
        let c1 = ChatId::from("c1");

        let first = local.keystroke(&c1);
        assert!(first.start);
        assert!(first.abandoned.is_none());

        let second = local.keystroke(&c1);
        assert!(!second.start);
        assert!(local.expire(first.generation).is_none(), "superseded timer must not clear the flag");
        assert!(local.is_typing());

        assert_eq!(local.expire(second.generation), Some(c1.clone()));
        assert!(!local.is_typing());
        assert!(local.keystroke(&c1).start);
    }

    #[test]
    fn switching_chats_abandons_the_previous_one() {
        let mut local = LocalTyping::default();
        local.keystroke(&ChatId::from("c1"));

        let switched = local.keystroke(&ChatId::from("c2"));
        assert!(switched.start);
        assert_eq!(switched.abandoned, Some(ChatId::from("c1")));
        assert_eq!(local.stop(), Some(ChatId::from("c2")));
        assert_eq!(local.stop(), None);
    }
}
