use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use rand::Rng;
use std::path::PathBuf;

/// most results stored in one group directory
pub const GROUP_CAPACITY: usize = 1000;

const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SUFFIX_LEN: usize = 3;

#[derive(Debug, Default)]
struct Group {
    day: String,
    name: String,
    len: usize,
}

/// Hands out `<day>/<group>/<HHMMSS>_<addr>_<suffix>` paths relative to the result dir
#[derive(Debug, Default)]
pub struct ResultPather {
    group: Mutex<Group>,
}

impl ResultPather {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_path(&self, addr: &str) -> PathBuf {
        self.next_path_at(Local::now().naive_local(), addr, &mut rand::rng())
    }

    pub fn next_path_at<R: Rng>(
        &self,
        now: NaiveDateTime,
        addr: &str,
        rng: &mut R,
    ) -> PathBuf {
        let day = now.format("%Y%m%d").to_string();
        let hms = now.format("%H%M%S").to_string();

        let mut group = self.group.lock();
        if group.day != day {
            *group = Group {
                day,
                ..Group::default()
            };
        }
        if group.name.is_empty() || group.len >= GROUP_CAPACITY {
            // a full group inside the same second still needs a new directory
            group.name = if group.name.starts_with(&hms) {
                format!("{hms}_{}", suffix(rng))
            } else {
                hms.clone()
            };
            group.len = 0;
        }
        group.len += 1;

        let mut path = PathBuf::from(&group.day);
        path.push(&group.name);
        path.push(format!("{hms}_{addr}_{}", suffix(rng)));

        path
    }
}

fn suffix<R: Rng>(rng: &mut R) -> String {
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARS[rng.random_range(0..SUFFIX_CHARS.len())] as char)
        .collect()
}
