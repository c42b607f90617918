use clap::Parser;
use eyre::Report;
use log::info;
use phylosim::cli::args::PhylosimArgs;
use phylosim::sim::run::run;
use phylosim::utils::global_init::{global_init, setup_logger};

fn main() -> Result<(), Report> {
  global_init();

  let args = PhylosimArgs::parse();
  setup_logger(args.verbosity);

  info!("{:#?}", &args);

  run(&args)
}
