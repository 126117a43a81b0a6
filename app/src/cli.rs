use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use screen_capture::DisplayMetrics;

use crate::display::parse_display_size;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Record(RecordArgs),
    Probe { display: DisplayMetrics },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordArgs {
    pub display_size: Option<DisplayMetrics>,
    pub output_folder: Option<PathBuf>,
    pub capture_target: Option<String>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub config: Option<PathBuf>,
    pub verbosity: u8,
    pub json: bool,
    pub action: Action,
}

fn display_size_arg() -> Arg {
    Arg::new("display-size")
        .long("display-size")
        .value_name("WxH")
        .help("Size of the display to capture, e.g. 1920x1080")
}

fn record_args() -> [Arg; 4] {
    [
        display_size_arg(),
        Arg::new("output")
            .long("output")
            .short('o')
            .value_name("DIR")
            .value_parser(value_parser!(PathBuf))
            .help("Folder that receives video_<millis>.mp4 files"),
        Arg::new("target")
            .long("target")
            .value_name("INPUT")
            .help("Capture input: X display (:0.0), avfoundation device, or 'desktop'"),
        Arg::new("duration")
            .long("duration")
            .short('d')
            .value_name("SECONDS")
            .value_parser(value_parser!(u64))
            .help("Stop automatically after this many seconds"),
    ]
}

pub fn command() -> Command {
    Command::new("screen-recorder")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Record the screen to an MP4 file")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Settings file (default: <config dir>/screen-recorder/settings.json)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help("More log output (-v debug, -vv trace)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print status as JSON lines"),
        )
        .args(record_args())
        .subcommand(
            Command::new("record")
                .about("Record until Enter, Ctrl+C, or --duration (default)")
                .args(record_args()),
        )
        .subcommand(
            Command::new("probe")
                .about("Show the encoder size chosen for a display, without recording")
                .arg(display_size_arg().required(true)),
        )
}

fn parse_record(matches: &ArgMatches) -> Result<RecordArgs> {
    let display_size = matches
        .get_one::<String>("display-size")
        .map(|s| parse_display_size(s))
        .transpose()?;
    Ok(RecordArgs {
        display_size,
        output_folder: matches.get_one::<PathBuf>("output").cloned(),
        capture_target: matches.get_one::<String>("target").cloned(),
        duration: matches.get_one::<u64>("duration").map(|s| Duration::from_secs(*s)),
    })
}

pub fn parse_from<I, T>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = command().try_get_matches_from(args)?;

    let action = match matches.subcommand() {
        Some(("probe", sub)) => {
            let size = sub
                .get_one::<String>("display-size")
                .context("--display-size is required")?;
            Action::Probe {
                display: parse_display_size(size)?,
            }
        }
        Some(("record", sub)) => Action::Record(parse_record(sub)?),
        _ => Action::Record(parse_record(&matches)?),
    };

    Ok(Cli {
        config: matches.get_one::<PathBuf>("config").cloned(),
        verbosity: matches.get_count("verbose"),
        json: matches.get_flag("json"),
        action,
    })
}
