/// Swarm health derived from seed and peer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Health {
    Unknown,
    Bad,
    Medium,
    Good,
    Excellent,
}

impl Health {
    /// Classifies `seeds / max(peers, 1)`.
    ///
    /// ```
    /// use torrent_stream::torrent::Health;
    ///
    /// assert_eq!(Health::from_counts(0, 0), Health::Unknown);
    /// assert_eq!(Health::from_counts(0, 10), Health::Bad);
    /// assert_eq!(Health::from_counts(10, 10), Health::Excellent);
    /// ```
    pub fn from_counts(seeds: u32, peers: u32) -> Self {
        if seeds == 0 && peers == 0 {
            return Health::Unknown;
        }

        let ratio = seeds as f64 / peers.max(1) as f64;
        if ratio < 0.1 {
            Health::Bad
        } else if ratio < 0.5 {
            Health::Medium
        } else if ratio < 1.0 {
            Health::Good
        } else {
            Health::Excellent
        }
    }
}
