use chrono::{DateTime, TimeZone, Utc};

/// One pool as the matchmaker reports it: tickets waiting there and
/// whether a worker is currently holding back to gather more
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    pub in_queue: usize,
    pub gathering: bool,
}

/// Heartbeat blob a matchmaker writes under its own id.
///
/// The director parses this to route tickets, so the text form has to
/// round-trip exactly: first line `count<TAB>local_time_micros`, then
/// one `name<TAB>queued<TAB>0|1` line per pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchmakerStatus {
    pub processing_tickets: usize,
    pub pools: Vec<PoolStatus>,
    /// Matchmaker-local wall clock, used by the director for clock
    /// compensation on assignment
    pub local_time: DateTime<Utc>,
}

impl MatchmakerStatus {
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "{}\t{}",
            self.processing_tickets,
            self.local_time.timestamp_micros()
        );
        for pool in &self.pools {
            out.push('\n');
            out.push_str(&pool.name);
            out.push('\t');
            out.push_str(&pool.in_queue.to_string());
            out.push('\t');
            out.push(if pool.gathering { '1' } else { '0' });
        }
        out
    }

    pub fn from_text(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let (count, time) = lines.next()?.split_once('\t')?;
        let processing_tickets = count.parse().ok()?;
        let local_time = Utc.timestamp_micros(time.parse().ok()?).single()?;

        let mut pools = Vec::new();
        for line in lines {
            let mut parts = line.splitn(3, '\t');
            let name = parts.next()?.to_string();
            let in_queue = parts.next()?.parse().ok()?;
            let gathering = match parts.next()? {
                "0" => false,
                "1" => true,
                _ => return None,
            };
            pools.push(PoolStatus {
                name,
                in_queue,
                gathering,
            });
        }

        Some(Self {
            processing_tickets,
            pools,
            local_time,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> MatchmakerStatus {
        MatchmakerStatus {
            processing_tickets: 42,
            pools: vec![
                PoolStatus {
                    name: String::new(),
                    in_queue: 7,
                    gathering: true,
                },
                PoolStatus {
                    name: "ranked".into(),
                    in_queue: 0,
                    gathering: false,
                },
            ],
            local_time: Utc.timestamp_micros(1_700_000_000_123_456).unwrap(),
        }
    }

    #[test]
    fn text_round_trips_exactly() {
        let status = sample();
        let text = status.to_text();
        let parsed = MatchmakerStatus::from_text(&text).unwrap();
        assert_eq!(parsed, status);
        assert_eq!(parsed.to_text(), text);
    }

    #[test]
    fn empty_pool_list_round_trips() {
        let status = MatchmakerStatus {
            processing_tickets: 0,
            pools: vec![],
            local_time: Utc.timestamp_micros(1).unwrap(),
        };
        let parsed = MatchmakerStatus::from_text(&status.to_text()).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(MatchmakerStatus::from_text("").is_none());
        assert!(MatchmakerStatus::from_text("not-a-count\t123").is_none());
        assert!(MatchmakerStatus::from_text("1\t2\npool\tx\t1").is_none());
        assert!(MatchmakerStatus::from_text("1\t2\npool\t3\t7").is_none());
    }
}
