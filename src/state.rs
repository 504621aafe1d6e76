use crate::endpoint::Endpoint;

/// Shared pool state: the raw ingest buffer, the parsed endpoint slice, the
/// effective set that passed the last health check, and the rotating cursor.
/// One lock in `Gateway` serializes every access; the two effective sequences
/// stay the same length with `effective_raw[i] == effective[i].raw`.
#[derive(Default)]
pub struct PoolState {
    pub raw_list: Vec<String>,
    pub endpoints: Vec<Endpoint>,
    effective_raw: Vec<String>,
    effective: Vec<Endpoint>,
    idx: usize,
}

impl PoolState {
    pub fn effective_len(&self) -> usize {
        self.effective.len()
    }

    pub fn cursor(&self) -> usize {
        self.idx
    }

    pub fn effective_raw(&self) -> &[String] {
        &self.effective_raw
    }

    pub fn effective_snapshot(&self) -> Vec<String> {
        self.effective_raw.clone()
    }

    /// The endpoint under the cursor, without advancing.
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        if self.effective.is_empty() {
            return None;
        }
        let idx = self.idx % self.effective.len();
        Some(self.effective[idx].clone())
    }

    /// The endpoint under the cursor, advancing it round-robin.
    pub fn next_endpoint(&mut self) -> Option<Endpoint> {
        if self.effective.is_empty() {
            return None;
        }
        if self.idx >= self.effective.len() {
            self.idx = 0;
        }
        let endpoint = self.effective[self.idx].clone();
        self.idx = (self.idx + 1) % self.effective.len();
        Some(endpoint)
    }

    pub fn advance_cursor(&mut self) {
        if !self.effective.is_empty() {
            self.idx = (self.idx + 1) % self.effective.len();
        }
    }

    /// Remove the first effective entry matching the endpoint's raw, keeping
    /// the cursor on the element it pointed at (or in range).
    pub fn evict(&mut self, endpoint: &Endpoint) {
        if let Some(pos) = self.effective_raw.iter().position(|raw| *raw == endpoint.raw) {
            self.effective_raw.remove(pos);
            self.effective.remove(pos);
            if pos < self.idx {
                self.idx -= 1;
            } else if pos == self.idx && self.idx >= self.effective.len() {
                self.idx = 0;
            }
        }
        if !self.effective.is_empty() && self.idx >= self.effective.len() {
            self.idx %= self.effective.len();
        }
        if self.effective.is_empty() {
            self.idx = 0;
        }
    }

    /// Swap in the survivors of a health-check cycle and reset the cursor.
    pub fn replace_effective(&mut self, endpoints: Vec<Endpoint>) {
        self.effective_raw = endpoints.iter().map(|ep| ep.raw.clone()).collect();
        self.effective = endpoints;
        self.idx = 0;
    }

    pub fn replace_endpoints(&mut self, endpoints: Vec<Endpoint>) {
        self.endpoints = endpoints;
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(self.effective_raw.len(), self.effective.len());
        for (raw, ep) in self.effective_raw.iter().zip(&self.effective) {
            assert_eq!(*raw, ep.raw);
        }
        if self.effective.is_empty() {
            assert_eq!(self.idx, 0);
        } else {
            assert!(self.idx < self.effective.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::parse_line;
    use crate::logger::{LogLevel, Logger};

    fn endpoints(lines: &[&str]) -> Vec<Endpoint> {
        let logger = Logger::new(LogLevel::None, false);
        lines
            .iter()
            .map(|line| parse_line(line, &logger).unwrap().unwrap())
            .collect()
    }

    fn state_of(lines: &[&str]) -> PoolState {
        let mut state = PoolState::default();
        state.replace_effective(endpoints(lines));
        state
    }

    #[test]
    fn empty_state_yields_nothing() {
        let mut state = PoolState::default();
        assert!(state.current_endpoint().is_none());
        assert!(state.next_endpoint().is_none());
        state.advance_cursor();
        assert_eq!(state.cursor(), 0);
    }

    #[test]
    fn next_endpoint_round_robins() {
        let mut state = state_of(&["1.1.1.1:1080", "2.2.2.2:1080", "3.3.3.3:1080"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(state.next_endpoint().unwrap().raw);
            state.assert_invariants();
        }
        assert_eq!(seen, vec!["1.1.1.1:1080", "2.2.2.2:1080", "3.3.3.3:1080"]);
        // Fourth call wraps around.
        assert_eq!(state.next_endpoint().unwrap().raw, "1.1.1.1:1080");
    }

    #[test]
    fn current_endpoint_does_not_advance() {
        let mut state = state_of(&["1.1.1.1:1080", "2.2.2.2:1080"]);
        assert_eq!(state.current_endpoint().unwrap().raw, "1.1.1.1:1080");
        assert_eq!(state.current_endpoint().unwrap().raw, "1.1.1.1:1080");
        state.advance_cursor();
        assert_eq!(state.current_endpoint().unwrap().raw, "2.2.2.2:1080");
    }

    #[test]
    fn evict_removes_and_keeps_cursor_in_range() {
        let mut state = state_of(&["1.1.1.1:1080", "2.2.2.2:1080"]);
        let first = state.next_endpoint().unwrap();
        state.evict(&first);
        state.assert_invariants();
        assert_eq!(state.effective_len(), 1);
        assert_eq!(state.cursor(), 0);
        assert_eq!(state.next_endpoint().unwrap().raw, "2.2.2.2:1080");
        assert!(!state.effective_raw().contains(&first.raw));
    }

    #[test]
    fn evict_before_cursor_shifts_it_back() {
        let mut state = state_of(&["1.1.1.1:1080", "2.2.2.2:1080", "3.3.3.3:1080"]);
        state.advance_cursor();
        state.advance_cursor(); // cursor on the third entry
        let victims = endpoints(&["1.1.1.1:1080"]);
        state.evict(&victims[0]);
        state.assert_invariants();
        // Cursor still points at the entry it pointed at before.
        assert_eq!(state.current_endpoint().unwrap().raw, "3.3.3.3:1080");
    }

    #[test]
    fn evict_at_end_wraps_cursor() {
        let mut state = state_of(&["1.1.1.1:1080", "2.2.2.2:1080"]);
        state.advance_cursor(); // cursor on the second entry
        let victims = endpoints(&["2.2.2.2:1080"]);
        state.evict(&victims[0]);
        state.assert_invariants();
        assert_eq!(state.cursor(), 0);
        assert_eq!(state.current_endpoint().unwrap().raw, "1.1.1.1:1080");
    }

    #[test]
    fn evict_unknown_raw_is_a_no_op() {
        let mut state = state_of(&["1.1.1.1:1080"]);
        let victims = endpoints(&["9.9.9.9:1080"]);
        state.evict(&victims[0]);
        state.assert_invariants();
        assert_eq!(state.effective_len(), 1);
    }

    #[test]
    fn evict_last_entry_resets_cursor() {
        let mut state = state_of(&["1.1.1.1:1080"]);
        let victims = endpoints(&["1.1.1.1:1080"]);
        state.evict(&victims[0]);
        state.assert_invariants();
        assert_eq!(state.effective_len(), 0);
        assert_eq!(state.cursor(), 0);
        assert!(state.current_endpoint().is_none());
    }

    #[test]
    fn replace_effective_resets_cursor() {
        let mut state = state_of(&["1.1.1.1:1080", "2.2.2.2:1080"]);
        state.advance_cursor();
        state.replace_effective(endpoints(&["3.3.3.3:1080"]));
        state.assert_invariants();
        assert_eq!(state.cursor(), 0);
        assert_eq!(state.current_endpoint().unwrap().raw, "3.3.3.3:1080");
    }
}
