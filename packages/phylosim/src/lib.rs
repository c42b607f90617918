pub mod alphabet;
pub mod cli;
pub mod constants;
pub mod genome;
pub mod indel;
pub mod io;
pub mod model;
pub mod rates;
pub mod sim;
pub mod tree;
pub mod utils;
