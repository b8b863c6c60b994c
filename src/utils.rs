pub mod io;
pub mod loader;
