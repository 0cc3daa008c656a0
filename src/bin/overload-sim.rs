use overload_sim::config::{self, Command, FormatArg};
use overload_sim::engine::SimulationEngine;
use overload_sim::error::Result;
use overload_sim::limiter::SafetyLimits;
use overload_sim::logging;
use overload_sim::output::{self, Formatter, HumanFormatter, JsonFormatter, SummaryFormatter};
use overload_sim::target::build_target;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = config::parse_args()?;
    logging::init(logging::level_for(cli.verbose));

    match cli.command {
        Command::Run(args) => {
            let plan = config::build_run(args)?;
            let limits = SafetyLimits::default();
            let target = build_target(plan.cluster.as_ref(), plan.params.seed, &limits)?;
            let mut engine = SimulationEngine::new(target, limits);
            let report = engine.start(&plan.params)?;

            let formatter = formatter_for(&plan.format);
            print!("{}", formatter.write(&report)?);
        }
        Command::ListAlgorithms => print!("{}", output::format_algorithms()),
        Command::ListProfiles => print!("{}", output::format_profiles()),
        Command::ListExtensions => print!("{}", output::format_extensions()),
        Command::ShowConfig(args) => {
            let cluster = config::build_show_config(&args)?;
            match args.format {
                FormatArg::Json => print!("{}", output::format_cluster_json(&cluster)?),
                FormatArg::Human | FormatArg::Summary => print!("{}", output::format_cluster(&cluster)),
            }
        }
    }

    Ok(())
}

fn formatter_for(format: &FormatArg) -> Box<dyn Formatter> {
    match format {
        FormatArg::Human => Box::new(HumanFormatter),
        FormatArg::Summary => Box::new(SummaryFormatter),
        FormatArg::Json => Box::new(JsonFormatter),
    }
}
