mod memory;
mod persistent;
mod utils;
