use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use journal_cleaner::cleaner::CheckpointStore;
use journal_cleaner::TopicPartition;
use std::path::PathBuf;

fn cli() -> Command {
    let log_dir = Arg::new("log-dir")
        .long("log-dir")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Storage directory holding a cleaner checkpoint file");

    Command::new("journal-cleaner")
        .about("Inspect and maintain log cleaner checkpoints")
        .subcommand_required(true)
        .subcommand(
            Command::new("checkpoints")
                .about("Print the last cleaned offset of every partition")
                .arg(log_dir.clone().action(ArgAction::Append)),
        )
        .subcommand(
            Command::new("truncate")
                .about("Lower the checkpoint of one partition so it is cleaned again")
                .arg(log_dir)
                .arg(Arg::new("topic").long("topic").required(true))
                .arg(
                    Arg::new("partition")
                        .long("partition")
                        .required(true)
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ),
        )
}

fn print_checkpoints(matches: &ArgMatches) -> journal_cleaner::Result<()> {
    let dirs: Vec<PathBuf> = matches
        .get_many::<PathBuf>("log-dir")
        .map(|dirs| dirs.cloned().collect())
        .unwrap_or_default();
    let store = CheckpointStore::open(&dirs)?;
    for dir in &dirs {
        println!("{}", dir.display());
        for (tp, offset) in store.checkpoints_for(dir) {
            println!("  {}\t{}", tp, offset);
        }
    }
    Ok(())
}

fn truncate_checkpoint(matches: &ArgMatches) -> journal_cleaner::Result<()> {
    let missing = |name: &str| journal_cleaner::Error::InvalidConfig(format!("missing --{}", name));
    let dir = matches.get_one::<PathBuf>("log-dir").ok_or_else(|| missing("log-dir"))?;
    let topic = matches.get_one::<String>("topic").ok_or_else(|| missing("topic"))?;
    let partition = *matches.get_one::<u32>("partition").ok_or_else(|| missing("partition"))?;
    let offset = *matches.get_one::<u64>("offset").ok_or_else(|| missing("offset"))?;

    let store = CheckpointStore::open(std::slice::from_ref(dir))?;
    let tp = TopicPartition::new(topic.clone(), partition);
    let before = store.last_cleaned(dir, &tp);
    store.truncate(dir, &tp, offset)?;
    log::info!(
        "{}: checkpoint {:?} -> {:?}",
        tp,
        before,
        store.last_cleaned(dir, &tp)
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("checkpoints", sub)) => print_checkpoints(sub)?,
        Some(("truncate", sub)) => truncate_checkpoint(sub)?,
        _ => unreachable!("clap enforces a subcommand"),
    }
    Ok(())
}
