//! Local feature file
//!
//! A SQLite file holding the layers the user edits. [`SqliteHost`] is the
//! adapter's view of it; [`ChangeJournal`] reports edits made by anyone,
//! including other `layersync` processes.

mod host;
mod journal;
pub mod schema;

pub use host::SqliteHost;
pub use journal::ChangeJournal;
