use std::io;

use clap::{CommandFactory, Parser};
use clap_complete::Shell;

/// Generate shell completion scripts.
#[derive(Debug, Parser)]
pub struct CompletionsCommand {
    /// Shell to generate completions for.
    pub shell: Shell,
}

impl CompletionsCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let mut cmd = super::Options::command();
        clap_complete::generate(self.shell, &mut cmd, "revue", &mut io::stdout());
        Ok(())
    }
}
