use super::EXIT_SUCCESS;
use clap::CommandFactory;
use clap_complete::Shell;

/// Print a completion script for `shell` on stdout.
pub fn run<C: CommandFactory>(shell: Shell) -> u8 {
    let mut cmd = C::command();
    let name = cmd.get_name().to_owned();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    EXIT_SUCCESS
}
