pub(crate) mod utils;

mod scripts;
mod test_runner;
