//! Operation event streaming with catch-up
//!
//! A late subscriber first replays committed history from the log, then
//! switches to the live broker stream. Rows committed during the switch can
//! appear in both; consumers deduplicate by operation id. A `Lost` marker on
//! the live stream means the subscriber should re-scan from its last seen id.

use warden_core::{Operation, Result};
use warden_oplog::{Broker, EventStream, OpLog};

/// Subscribe to operation events, returning the catch-up prelude (every row
/// with id past `since_id`) and the live stream.
pub fn subscribe_with_catchup(
    oplog: &OpLog,
    broker: &Broker,
    since_id: i64,
) -> Result<(Vec<Operation>, EventStream)> {
    // Subscribe before scanning so nothing can fall between the two.
    let stream = broker.subscribe();
    let mut prelude = Vec::new();
    oplog.for_each(since_id, |op| {
        prelude.push(op.clone());
        Ok(())
    })?;
    Ok((prelude, stream))
}
