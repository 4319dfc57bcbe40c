//! CLI command implementations.
//!
//! | Module     | Commands handled      |
//! |------------|-----------------------|
//! | `serve`    | `Serve`               |
//! | `project`  | `List`, `Status`      |
//! | `config`   | `Init`, `Config`      |

pub mod config;
pub mod project;
pub mod serve;

pub use config::{cmd_config, cmd_init};
pub use project::{cmd_list, cmd_status};
pub use serve::{ServeOverrides, cmd_serve};
