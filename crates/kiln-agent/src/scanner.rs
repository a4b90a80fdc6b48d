use std::{collections::HashMap, path::Path, sync::OnceLock};

use kiln_process::PlayerCount;
use regex::Regex;

// A newline-free stream must not grow the residual without bound.
const MAX_RESIDUAL_BYTES: usize = 8 * 1024;
const DEFAULT_MAX_PLAYERS: u32 = 20;

fn matchers() -> &'static [Regex] {
    static MATCHERS: OnceLock<Vec<Regex>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        [
            // Vanilla / Paper: "There are 3 of a max of 20 players online: ..."
            r"(?i)there are (\d+) of a max(?: of)? (\d+) players online",
            // Older servers: "There are 3/20 players online:"
            r"(?i)there are (\d+)\s*/\s*(\d+) players online",
            r"(?i)players online:?\s*(\d+)\s*/\s*(\d+)",
            r"(?i)online players\s*\((\d+)\s*/\s*(\d+)\)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("status-line pattern is valid"))
        .collect()
    })
}

/// First matcher wins; `None` is the common case and never an error.
pub fn parse_player_count(line: &str) -> Option<PlayerCount> {
    matchers().iter().find_map(|re| {
        let caps = re.captures(line)?;
        let online = caps.get(1)?.as_str().parse().ok()?;
        let max = caps.get(2)?.as_str().parse().ok()?;
        Some(PlayerCount { online, max })
    })
}

/// Per-instance line splitter feeding [`parse_player_count`].
#[derive(Debug, Default)]
pub struct StatusScanner {
    residual: HashMap<String, String>,
    counts: HashMap<String, PlayerCount>,
}

impl StatusScanner {
    /// Returns the last count matched in `text`, if any.
    pub fn feed(&mut self, instance_id: &str, text: &str) -> Option<PlayerCount> {
        let buf = self.residual.entry(instance_id.to_string()).or_default();
        buf.push_str(text);

        let mut last = None;
        if let Some(end) = buf.rfind('\n') {
            let rest = buf.split_off(end + 1);
            for line in buf.lines() {
                if let Some(c) = parse_player_count(line.trim_end_matches('\r')) {
                    last = Some(c);
                }
            }
            *buf = rest;
        }

        if buf.len() > MAX_RESIDUAL_BYTES {
            let mut cut = buf.len() - MAX_RESIDUAL_BYTES;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }

        if let Some(c) = last {
            self.counts.insert(instance_id.to_string(), c);
        }
        last
    }

    pub fn count(&self, instance_id: &str) -> Option<PlayerCount> {
        self.counts.get(instance_id).copied()
    }

    pub fn forget(&mut self, instance_id: &str) {
        self.residual.remove(instance_id);
        self.counts.remove(instance_id);
    }
}

/// `max-players=` from `server.properties` in the instance directory.
pub fn read_max_players(instance_dir: &Path) -> u32 {
    let raw = std::fs::read_to_string(instance_dir.join("server.properties")).unwrap_or_default();
    for line in raw.lines() {
        let l = line.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }
        if let Some(rest) = l.strip_prefix("max-players=")
            && let Ok(v) = rest.trim().parse::<u32>()
        {
            return v;
        }
    }
    DEFAULT_MAX_PLAYERS
}
