use std::io::IsTerminal;

mod progress;
mod spinner;
mod status;
mod table;

pub use progress::bounded_bar;
pub use spinner::with_spinner;
pub use status::{print_command_status, CommandStatus};
pub use table::{apply_column_padding, header, styled_table, truncate};

pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}
