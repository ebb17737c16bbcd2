// SPDX-License-Identifier: GPL-3.0-only

//! Diagnostic command-line surface
//!
//! Exercises the HAL without an Android framework on top: list the
//! built-in profiles, normalize a parameter string the way a client
//! would see it, decode a dumped interleaved transfer, or run a live
//! session against a video node until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use camhal::config::HalConfig;
use camhal::exif::SoftwareExif;
use camhal::hw::HeapAllocator;
use camhal::hw::v4l2::V4l2CaptureDevice;
use camhal::media::{SoftwareCompressor, SoftwareScaler};
use camhal::session::{CameraSession, Collaborators};
use camhal::sink::{CameraSink, DataKind, NotifyKind};
use camhal::types::{BufferDescriptor, Geometry};
use camhal::{demux, layout, profile};

#[derive(Parser)]
#[command(name = "camhal")]
#[command(about = "Diagnostic tool for the interleaved-sensor camera HAL")]
#[command(version = env!("GIT_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in device profiles
    List,

    /// Dump one profile's capability table as JSON
    Show {
        /// Sensor name (from 'camhal list')
        profile: String,
    },

    /// Print the parameter table a client would see
    Params {
        /// Sensor name
        profile: String,

        /// Overlay key=value pairs before printing
        #[arg(short, long, value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Decode a dumped interleaved transfer and print its statistics
    Decode {
        /// Raw transfer dump
        file: PathBuf,

        /// Preview width the transfer was captured at
        #[arg(long)]
        width: u32,

        /// Preview height the transfer was captured at
        #[arg(long)]
        height: u32,

        /// Transfer layout name
        #[arg(long, default_value = "s5c73m3.v1")]
        layout: String,

        /// Write the extracted scanlines here
        #[arg(long)]
        dump_yuv: Option<PathBuf>,

        /// Write the extracted compressed picture here
        #[arg(long)]
        dump_jpeg: Option<PathBuf>,
    },

    /// Stream previews from a real device node until Ctrl-C
    Stream {
        /// Sensor name selecting the profile
        #[arg(short, long, default_value = "S5C73M3")]
        camera: String,

        /// Video node; defaults to the configured node for the sensor
        #[arg(short, long)]
        node: Option<PathBuf>,

        /// Stop after this many delivered frames
        #[arg(short, long)]
        frames: Option<usize>,
    },
}

pub fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::List => list(),
        Commands::Show { profile } => show(&profile),
        Commands::Params { profile, set } => params(&profile, &set),
        Commands::Decode {
            file,
            width,
            height,
            layout,
            dump_yuv,
            dump_jpeg,
        } => decode(&file, Geometry::new(width, height), &layout, dump_yuv, dump_jpeg),
        Commands::Stream { camera, node, frames } => stream(&camera, node, frames),
    }
}

fn list() -> Result<(), Box<dyn std::error::Error>> {
    println!("Built-in device profiles:");
    println!();
    for (index, profile) in profile::profiles().iter().enumerate() {
        println!(
            "  [{}] {:10} {}-facing, mounted at {} deg, {}",
            index,
            profile.name,
            profile.facing,
            profile.orientation,
            if profile.hybrid {
                "hybrid interleaved transfer"
            } else {
                "managed ISP stream"
            }
        );
    }
    Ok(())
}

fn show(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let profile = profile::by_name(name).ok_or_else(|| format!("no profile named '{name}'"))?;
    println!("{}", serde_json::to_string_pretty(profile)?);
    Ok(())
}

fn params(name: &str, overlays: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let profile = profile::by_name(name).ok_or_else(|| format!("no profile named '{name}'"))?;
    let mut engine = camhal::params::ParameterEngine::new(profile);
    let mut device = camhal::hw::mock::MockCaptureDevice::new();
    engine.apply(true, &mut device)?;

    if !overlays.is_empty() {
        let mut incoming = camhal::params::ParameterTable::new();
        for overlay in overlays {
            let (key, value) = overlay
                .split_once('=')
                .ok_or_else(|| format!("'{overlay}' is not KEY=VALUE"))?;
            incoming.set(key, value);
        }
        engine.merge(&incoming);
        engine.apply(false, &mut device)?;
    }

    for (key, value) in engine.table().iter() {
        println!("{key}={value}");
    }
    Ok(())
}

fn decode(
    file: &PathBuf,
    geometry: Geometry,
    layout_name: &str,
    dump_yuv: Option<PathBuf>,
    dump_jpeg: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let layout =
        layout::lookup(layout_name).ok_or_else(|| format!("no layout named '{layout_name}'"))?;
    let data = std::fs::read(file)?;
    let mut yuv = Vec::new();
    let mut jpeg = Vec::new();
    let descriptor = demux::demultiplex(layout, &data, geometry, 15, &mut yuv, &mut jpeg)?;

    println!("transfer:   {} bytes", data.len());
    println!("scanlines:  {} bytes at {}", descriptor.yuv_length, geometry);
    println!(
        "still:      {}",
        if descriptor.decoded {
            format!("{} bytes", descriptor.jpeg_length)
        } else {
            "not decoded".into()
        }
    );
    println!("af status:  {:#04x}", descriptor.auto_focus_status);
    println!("faces:      {}", descriptor.faces.len());
    for face in &descriptor.faces {
        println!(
            "  rect ({}, {}, {}, {}) score {} id {}",
            face.rect[0], face.rect[1], face.rect[2], face.rect[3], face.score, face.id
        );
    }
    if descriptor.decoded {
        let exif = &descriptor.exif;
        println!(
            "exif:       iso {} flash {} brightness {} bias {}/10 exposure 1/{}",
            exif.iso, exif.flash, exif.brightness, exif.exposure_bias, exif.exposure_time_den
        );
    }

    if let Some(path) = dump_yuv {
        std::fs::write(&path, &yuv[..descriptor.yuv_length])?;
        println!("scanlines written to {}", path.display());
    }
    if let Some(path) = dump_jpeg {
        if descriptor.jpeg_length == 0 {
            return Err("transfer carries no compressed picture".into());
        }
        std::fs::write(&path, &jpeg[..descriptor.jpeg_length])?;
        println!("still written to {}", path.display());
    }
    Ok(())
}

/// Sink that counts deliveries and prints a line per notification
struct CountingSink {
    previews: AtomicUsize,
}

impl CameraSink for CountingSink {
    fn on_notify(&self, kind: NotifyKind, arg1: i32, arg2: i32) {
        println!("notify: {kind:?} ({arg1}, {arg2})");
    }

    fn on_data(&self, kind: DataKind, buffer: &BufferDescriptor) {
        if kind == DataKind::PreviewFrame {
            let count = self.previews.fetch_add(1, Ordering::SeqCst) + 1;
            if count % 30 == 0 {
                println!("{count} preview frames ({} bytes each)", buffer.payload.len());
            }
        }
    }

    fn on_data_timestamp(&self, _timestamp_ns: i64, _kind: DataKind, _buffer: &BufferDescriptor) {}
}

fn stream(
    camera: &str,
    node: Option<PathBuf>,
    frames: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let profile = profile::by_name(camera).ok_or_else(|| format!("no profile named '{camera}'"))?;
    let config = HalConfig::load();
    let node = node.unwrap_or_else(|| config.node_for(profile.facing).to_path_buf());
    info!(sensor = profile.name, node = %node.display(), "starting stream");

    let device = V4l2CaptureDevice::open(&node)?;
    let sink = Arc::new(CountingSink {
        previews: AtomicUsize::new(0),
    });
    let session = CameraSession::open(
        profile,
        Collaborators {
            device: Box::new(device),
            allocator: Box::new(HeapAllocator),
            compressor: Box::new(SoftwareCompressor),
            composer: Box::new(SoftwareExif::new()),
            preview_path: Box::new(SoftwareScaler::new()),
            recording_path: Box::new(SoftwareScaler::new()),
        },
        Arc::clone(&sink) as Arc<dyn CameraSink>,
        config.tuning(),
    )?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    session.start_preview()?;
    println!("streaming, Ctrl-C to stop");
    loop {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        if let Some(limit) = frames {
            if sink.previews.load(Ordering::SeqCst) >= limit {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let delivered = sink.previews.load(Ordering::SeqCst);
    session.stop_preview();
    session.close();
    println!("{delivered} preview frames delivered");
    Ok(())
}
