use clap::Parser;
use dms::{DiskImage, HeaderInfo, TrackReport, UnpackOptions};
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Parser, Debug)]
#[command(name = "dms")]
#[command(version, about = "Amiga DMS (.dms) disk archive reader", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Show the file header of DMS archives
    Info {
        /// Paths to DMS (.dms) files
        #[arg(required = true)]
        inputs: Vec<String>,
    },
    /// Unpack DMS archives into ADF disk images
    Extract {
        /// Paths to DMS (.dms) files
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Output directory (defaults to current directory)
        #[arg(short, long)]
        output: Option<String>,

        /// Password for encrypted archives
        #[arg(short, long)]
        password: Option<String>,

        /// Keep going past damaged tracks
        #[arg(long)]
        tolerant: bool,

        /// Write gzip-compressed .adz images
        #[arg(long)]
        adz: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Info { inputs } => {
            for input in &inputs {
                let data = fs::read(input)?;
                match dms::read_header_info(&data) {
                    Ok(header) => print_header(input, &header),
                    Err(e) => eprintln!("{}: {}", input, e),
                }
            }
        }
        Commands::Extract {
            inputs,
            output,
            password,
            tolerant,
            adz,
            verbose,
        } => {
            let output_base = output
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));

            if !output_base.exists() {
                fs::create_dir_all(&output_base)?;
            }

            let options = UnpackOptions {
                passphrase: password.as_deref().map(str::as_bytes),
                tolerant,
            };

            println!("Unpacking {} archives...", inputs.len());

            let errors = AtomicUsize::new(0);
            inputs.par_iter().for_each(|input| {
                let path = Path::new(input);
                if let Err(e) = extract_archive(path, &output_base, &options, adz, verbose) {
                    eprintln!("Error extracting {}: {}", input, e);
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            });

            if errors.load(Ordering::Relaxed) > 0 {
                eprintln!(
                    "Warning: {} archives failed to extract",
                    errors.load(Ordering::Relaxed)
                );
            }
        }
    }

    println!("Done.");
    Ok(())
}

fn print_header(input: &str, header: &HeaderInfo) {
    println!("{}:", input);
    println!(
        "  Creator version: {}.{:02}",
        header.creator_version / 100,
        header.creator_version % 100
    );
    println!("  Created:         {} (Unix time)", header.created);
    println!("  Tracks:          {} to {}", header.track_lo, header.track_hi);
    println!("  Packed size:     {}", header.packed_size);
    println!("  Unpacked size:   {}", header.unpacked_size);
    println!(
        "  Density:         {}",
        if header.is_high_density() { "HD" } else { "DD" }
    );
    println!(
        "  Disk type:       {} ({})",
        header.disk_type_name(),
        header.disk_type
    );
    println!(
        "  Compression:     {} ({})",
        header.compression_mode_name(),
        header.compression_mode
    );
    println!(
        "  Flags:           0x{:04X} {}",
        header.general_info,
        header.flag_names().join(" ")
    );
}

fn print_track(input: &Path, report: &TrackReport) {
    let h = &report.header;
    println!(
        "  {}: track {:2} {:<6} {:5} -> {:5} flags 0x{:02X}{}{}",
        input.display(),
        h.number,
        h.mode_name(),
        h.packed_len,
        h.unpacked_len,
        h.flags,
        if report.crc_ok { "" } else { " [CRC]" },
        if report.checksum_ok { "" } else { " [CHECKSUM]" },
    );
}

fn extract_archive(
    input: &Path,
    output_base: &Path,
    options: &UnpackOptions<'_>,
    adz: bool,
    verbose: bool,
) -> Result<(), BoxError> {
    let data = fs::read(input)?;
    if !dms::detect(&data) {
        return Err(format!("{} is not a DMS archive", input.display()).into());
    }
    let header = dms::read_header_info(&data)?;

    let mut image = vec![0u8; header.image_capacity()];
    let unpacked = dms::decompress_with(&data, &mut image, options, |report| {
        if verbose {
            print_track(input, report);
        }
    })?;
    image.truncate(unpacked.written);
    let image = DiskImage {
        data: image,
        header: unpacked.header,
        side_channels: unpacked.side_channels,
        truncated: unpacked.truncated,
    };
    if image.truncated {
        eprintln!(
            "Warning: {} has more track records than its header declares",
            input.display()
        );
    }

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());
    let image_path = output_base.join(format!("{}.{}", stem, if adz { "adz" } else { "adf" }));
    write_image(&image_path, &image.data, adz)?;

    if let Some(banner) = image.side_channels.banner_text() {
        fs::write(output_base.join(format!("{}.banner.txt", stem)), banner)?;
    }
    if let Some(file_id) = &image.side_channels.file_id {
        fs::write(output_base.join(format!("{}.fileid.diz", stem)), file_id)?;
    }

    println!(
        "  {} -> {} ({} bytes)",
        input.display(),
        image_path.display(),
        image.data.len()
    );
    if verbose {
        println!("  MD5: {:x}", md5::compute(&image.data));
    }
    Ok(())
}

fn write_image(path: &Path, data: &[u8], adz: bool) -> std::io::Result<()> {
    let file = File::create(path)?;
    if adz {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(data)?;
        encoder.finish()?;
    } else {
        let mut file = file;
        file.write_all(data)?;
    }
    Ok(())
}
