use http::Method;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates correlation ids of the form `{method}{path}${random}.{sequence}@{millis}`.
///
/// The sequence makes every id from one generator distinct; the random part
/// and the timestamp keep ids from different clients apart in peer logs.
#[derive(Debug, Default)]
pub(crate) struct IdGenerator {
    sequence: u64,
}

impl IdGenerator {
    pub fn next(&mut self, method: &Method, path: &str) -> String {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis());

        format!(
            "{}{path}${}.{sequence}@{millis}",
            method.as_str().to_ascii_lowercase(),
            rand::random::<u32>(),
        )
    }
}
