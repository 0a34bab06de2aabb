use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use trellis_types::PeerId;

#[derive(Debug, Clone, Copy)]
struct Penalty {
    score: f64,
    updated_at: Instant,
}

/// Tracks locally misbehaving peers. Every report adds a fixed penalty; the
/// accumulated score decays exponentially, so a peer is forgiven unless it
/// keeps failing.
#[derive(Debug)]
pub struct Blacklist {
    penalties: Mutex<HashMap<PeerId, Penalty>>,
    penalty: f64,
    threshold: f64,
    halflife: Duration,
}

impl Blacklist {
    pub fn new(penalty: f64, threshold: f64, halflife: Duration) -> Self {
        Self {
            penalties: Mutex::new(HashMap::new()),
            penalty,
            threshold,
            halflife,
        }
    }

    fn decayed(&self, penalty: &Penalty, now: Instant) -> f64 {
        let elapsed = now.duration_since(penalty.updated_at).as_secs_f64();
        let halflife = self.halflife.as_secs_f64().max(f64::EPSILON);
        penalty.score * 0.5f64.powf(elapsed / halflife)
    }

    pub fn report(&self, peer: &PeerId) {
        let now = Instant::now();
        let mut penalties = self.penalties.lock().unwrap();
        let entry = penalties.entry(peer.clone()).or_insert(Penalty {
            score: 0.0,
            updated_at: now,
        });
        entry.score = self.decayed(entry, now) + self.penalty;
        entry.updated_at = now;
    }

    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        let penalties = self.penalties.lock().unwrap();
        penalties
            .get(peer)
            .map(|penalty| self.decayed(penalty, now) >= self.threshold)
            .unwrap_or(false)
    }

    /// Drops fully forgiven entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.penalties
            .lock()
            .unwrap()
            .retain(|_, penalty| self.decayed(penalty, now) > 0.01);
    }
}
