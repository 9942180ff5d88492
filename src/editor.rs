//! The surface the agent reports to. In an editor this is the notification area and the
//! external browser; the command line prints instead.

use anyhow::Result;
use tracing::info;

#[cfg_attr(test, mockall::automock)]
pub trait Editor: Send + Sync {
    fn show_information_message(&self, message: &str);

    fn launch_url(&self, url: &str) -> Result<()>;
}

pub struct ConsoleEditor;

impl Editor for ConsoleEditor {
    fn show_information_message(&self, message: &str) {
        info!("{message}");
        println!("{message}");
    }

    fn launch_url(&self, url: &str) -> Result<()> {
        info!("Opening {url}");
        println!("Opening {url}");
        open::that(url)?;
        Ok(())
    }
}
