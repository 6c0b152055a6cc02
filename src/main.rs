// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Inspects a V4L2 stateless decoder and prints what it can decode.

use std::io;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use log::debug;
use log::error;
use log::warn;
use v4l2_codecs::format::Fourcc;
use v4l2_codecs::CodedFormat;
use v4l2_codecs::Decoder;
use v4l2_codecs::DecoderConfig;
use v4l2_codecs::DecoderDevice;
use v4l2_codecs::V4l2Device;

/// Width and height of the sink format set while listing decoded formats.
const SINK_WIDTH: u32 = 320;
const SINK_HEIGHT: u32 = 240;

#[derive(FromArgs)]
/// V4L2 stateless decoder tools.
struct Args {
    /// log level: error, warn, info, debug or trace. Defaults to RUST_LOG, then info.
    #[argh(option)]
    log_level: Option<String>,
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Inspect(InspectCommand),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "inspect")]
/// Print the capabilities and formats of a decoder.
struct InspectCommand {
    /// media controller node, e.g. /dev/media0
    #[argh(option)]
    media: Option<PathBuf>,
    /// video node of the decoder, e.g. /dev/video0
    #[argh(option)]
    video: Option<PathBuf>,
    /// JSON decoder configuration. --media and --video take precedence over it.
    #[argh(option)]
    cfg: Option<PathBuf>,
}

impl InspectCommand {
    fn config(&self) -> anyhow::Result<DecoderConfig> {
        let mut config = match &self.cfg {
            Some(path) => DecoderConfig::from_json_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DecoderConfig::default(),
        };
        if let Some(media) = &self.media {
            config.media_device = media.clone();
        }
        if let Some(video) = &self.video {
            config.video_device = video.clone();
        }
        Ok(config)
    }
}

fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.init();
}

/// Writes a report of `decoder` to `out`.
///
/// Every stateless coded format is listed with its frame sizes and the decoded formats the
/// driver offers once a small sink format is set.
fn report<D: DecoderDevice, W: Write>(decoder: &Decoder<D>, out: &mut W) -> anyhow::Result<()> {
    let caps = decoder.capabilities()?;
    writeln!(out, "driver: {}", caps.driver)?;
    writeln!(out, "card: {}", caps.card)?;
    writeln!(out, "bus: {}", caps.bus_info)?;
    writeln!(out, "version: {}", caps.version)?;
    writeln!(
        out,
        "api: {}",
        if caps.mplane {
            "multi-planar"
        } else {
            "single-planar"
        }
    )?;

    let sink_formats = decoder
        .enum_sink_formats()
        .context("failed to enumerate coded formats")?;
    for fourcc in sink_formats {
        let Some(coded) = CodedFormat::from_fourcc(fourcc) else {
            debug!("skipping non stateless format {}", fourcc);
            continue;
        };
        writeln!(out, "{} ({}):", coded, fourcc)?;

        let sizes = decoder.enum_frame_sizes(fourcc)?;
        if sizes.is_empty() {
            warn!("{} reports no frame sizes", coded);
        }
        for size in sizes {
            writeln!(out, "  size: {}", size)?;
        }

        if let Err(e) = decoder.set_sink_format(fourcc, SINK_WIDTH, SINK_HEIGHT, 8) {
            warn!("Failed to list decoded formats of {}: {}", coded, e);
            continue;
        }
        let decoded: Vec<String> = decoder
            .enum_src_formats()?
            .into_iter()
            .map(|f: Fourcc| f.to_string())
            .collect();
        writeln!(out, "  decoded: {}", decoded.join(" "))?;
    }
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Inspect(cmd) => {
            let config = cmd.config()?;
            let decoder = Decoder::<V4l2Device>::new(config.clone());
            decoder.open().with_context(|| {
                format!(
                    "failed to open {} and {}",
                    config.media_device.display(),
                    config.video_device.display()
                )
            })?;
            let stdout = io::stdout();
            report(&decoder, &mut stdout.lock())
        }
    }
}

fn main() {
    let args: Args = argh::from_env();
    init_logging(args.log_level.as_deref());
    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use v4l2_codecs::fake::FakeDevice;
    use v4l2_codecs::fake::FakeOptions;

    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["v4l2sl"], args).unwrap()
    }

    #[test]
    fn command_line_overrides_config_file() {
        let mut cfg = tempfile::NamedTempFile::new().unwrap();
        write!(
            cfg,
            r#"{{"media_device": "/dev/media3", "video_device": "/dev/video7", "live": true}}"#
        )
        .unwrap();
        let path = cfg.path().to_str().unwrap();

        let args = parse(&["inspect", "--cfg", path, "--video", "/dev/video2"]);
        let Command::Inspect(cmd) = args.command;
        let config = cmd.config().unwrap();
        assert_eq!(config.media_device, PathBuf::from("/dev/media3"));
        assert_eq!(config.video_device, PathBuf::from("/dev/video2"));
        assert!(config.live);
        assert_eq!(config.render_delay(), 0);
    }

    #[test]
    fn log_level_is_global() {
        let args = parse(&["--log-level", "debug", "inspect"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn report_lists_stateless_formats() {
        let decoder =
            Decoder::with_device(Default::default(), FakeDevice::new(FakeOptions::default()));
        let mut out = Vec::new();
        report(&decoder, &mut out).unwrap();
        let report = String::from_utf8(out).unwrap();
        assert!(report.contains("driver: fake"));
        assert!(report.contains("version: 6.8.0"));
        assert!(report.contains("HEVC (S265):"));
        assert!(report.contains("decoded: NV12 YU12"));
    }
}
