pub mod atomic_file;
pub mod ids;
pub mod verbosity;

pub use atomic_file::write_atomic;
pub use ids::new_session_id;
pub use verbosity::{at_least, set_verbosity, verbosity, Verbosity};
