use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::time::Duration;
use std::{panic, process};

pub mod audio_input;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod gfx;
pub mod pacer;
pub mod recorder;
pub mod signals;
pub mod sink;

use config::{RecordMode, RecordOptions};
use recorder::SessionEnd;

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(config::app_name())
        .version(config::version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("window")
                .short('w')
                .long("window")
                .value_name("TARGET")
                .help("Capture target: 'screen', 'focused', a window id or an output name.")
                .default_value("screen"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Output file, or the save directory when --replay is set.")
                .required(true),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .help("Output framerate.")
                .default_value("60"),
        )
        .arg(
            Arg::new("replay")
                .short('r')
                .long("replay")
                .value_name("SECONDS")
                .help("Record into a replay buffer of this many seconds instead of a file."),
        )
        .arg(
            Arg::new("audio")
                .short('a')
                .long("audio")
                .value_name("DEVICES")
                .help("Audio track: device name, 'default' or 'none'; '|' merges devices into one track.")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("quality")
                .short('q')
                .long("quality")
                .value_name("QUALITY")
                .help("Video quality: medium, high, very_high or ultra.")
                .default_value("very_high"),
        )
        .arg(
            Arg::new("container")
                .short('c')
                .long("container")
                .value_name("FORMAT")
                .help("Container format: mkv or mp4.")
                .default_value("mkv"),
        )
        .arg(
            Arg::new("keyframe-interval")
                .short('k')
                .long("keyframe-interval")
                .value_name("SECONDS")
                .help("Keyframe interval; bounds replay save granularity.")
                .default_value("2"),
        )
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .value_name("BACKEND")
                .help("Capture backend: dmabuf, interop or grab (default: auto)."),
        )
        .arg(
            Arg::new("no-cursor")
                .long("no-cursor")
                .help("Leave the cursor out of the recording.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let options = match build_options(&matches) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    let sos = signals::SignalOfStop::new();
    if let Err(e) = signals::install(&sos) {
        eprintln!("Error: failed to install signal handlers: {:#}", e);
        process::exit(1);
    }

    match recorder::run(&options, sos) {
        Ok(SessionEnd::Clean) => {}
        Ok(SessionEnd::Error) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn build_options(matches: &clap::ArgMatches) -> anyhow::Result<RecordOptions> {
    let target = config::parse_target(matches.get_one::<String>("window").unwrap());
    let fps: u32 = matches.get_one::<String>("fps").unwrap().parse()?;
    let quality = matches.get_one::<String>("quality").unwrap().parse()?;
    let container = matches.get_one::<String>("container").unwrap().parse()?;
    let gop_secs: u32 = matches
        .get_one::<String>("keyframe-interval")
        .unwrap()
        .parse()?;
    let backend = matches
        .get_one::<String>("backend")
        .map(|s| s.parse())
        .transpose()?;

    let output = PathBuf::from(matches.get_one::<String>("output").unwrap());
    let mode = match matches.get_one::<String>("replay") {
        Some(secs) => RecordMode::Replay {
            window: Duration::from_secs(secs.parse()?),
            output_dir: output,
        },
        None => RecordMode::Continuous { output },
    };

    let tracks = matches
        .get_many::<String>("audio")
        .map(|values| values.map(|v| config::parse_track(v)).collect())
        .unwrap_or_default();

    let options = RecordOptions {
        target,
        fps,
        capture_cursor: !matches.get_flag("no-cursor"),
        quality,
        container,
        gop_secs,
        backend,
        mode,
        tracks,
    };
    options.validate()?;
    Ok(options)
}
