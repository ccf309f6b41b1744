use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

/// scores at or below this are treated as "no result"
pub const TRIVIAL_SCORE: f64 = 0.000001;

/// Best score record pulled out of a solver statlog, lower `kmpp` is better
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreSummary {
    #[serde(rename = "Kmpp")]
    pub kmpp: f64,
    #[serde(rename = "Spread")]
    pub spread: f64,
    #[serde(rename = "Std")]
    pub std: f64,
}

impl ScoreSummary {
    /// true if this score can take part in best-of comparisons
    pub fn is_qualifying(&self) -> bool {
        self.kmpp > TRIVIAL_SCORE
    }

    /// strictly lower score
    pub fn beats(&self, other: &ScoreSummary) -> bool {
        self.kmpp < other.kmpp
    }
}

/// Result document POSTed by the runner and stored by the ingest server
///
/// Every field is optional on the wire, older clients only send the solution and statsum.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ResultMessage {
    #[serde(rename = "n")]
    pub job: String,
    /// start, epoch milliseconds
    #[serde(rename = "s")]
    pub started: i64,
    /// finish, epoch milliseconds
    #[serde(rename = "t")]
    pub finished: i64,
    /// run time in seconds
    #[serde(rename = "r")]
    pub seconds: f64,
    #[serde(rename = "b")]
    pub score: ScoreSummary,
    pub ok: bool,

    #[serde(rename = "bestKmpp.dsz", default)]
    pub solution_b64: String,
    #[serde(default)]
    pub statsum: String,
    #[serde(rename = "binlog", default, skip_serializing_if = "String::is_empty")]
    pub binlog_b64: String,
}

impl ResultMessage {
    pub fn set_solution(&mut self, solution: &[u8]) {
        self.solution_b64 = STANDARD.encode(solution);
    }

    pub fn set_binlog(&mut self, binlog: &[u8]) {
        self.binlog_b64 = STANDARD.encode(binlog);
    }

    pub fn solution(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.solution_b64)
    }

    /// the text a submission is deduplicated on: the solution, or the statlog summary without one
    pub fn dedup_key(&self) -> Option<&str> {
        [self.solution_b64.as_str(), self.statsum.as_str()]
            .into_iter()
            .find(|value| !value.is_empty())
    }
}
