//! History command handler

use std::time::Duration;

use anyhow::Result;

use finishline_core::Config;

use crate::output::Output;
use crate::session::Session;

/// Time given to peers to answer a history request
const PEER_ANSWER_WAIT: Duration = Duration::from_secs(1);

/// List assignments, optionally pulling everything first
pub async fn list(config: Config, pull: bool, output: &Output) -> Result<()> {
    let mut session = Session::open(config)?;

    if pull {
        let online = session.connect(output).await?;
        match session.engine.request_history().await {
            Ok(changed) if changed > 0 => {
                output.message(&format!("{} assignment(s) updated from history", changed))
            }
            Ok(_) => {}
            Err(e) => output.warn(&format!("History store unavailable: {}", e)),
        }
        if online {
            tokio::time::sleep(PEER_ANSWER_WAIT).await;
        }
    }

    let assignments = session.engine.state().await.register.to_vec();
    session.close().await?;

    output.print_assignments(&assignments);
    Ok(())
}
