use clap::{Parser, Subcommand};
use devimage::config::CaptureConfig;
use devimage::{BlockReader, FileBlockReader, Reader, Writer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devimage", version = "0.1.0", about = "Block device image container CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a source file/device into a new image container
    Capture {
        /// Source to read (a regular file stands in for a block device)
        source: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Target uncompressed bytes per chunk
        #[arg(long, default_value = "4194304")]
        chunk_size: u32,
        #[arg(long, default_value = "512")]
        sector_size: u32,
        #[arg(long, default_value = "")]
        fs_tag: String,
        #[arg(long)]
        parallelism: Option<usize>,
        #[arg(long, default_value = "2")]
        pipeline_depth: usize,
    },
    /// Resume an interrupted capture
    Resume {
        source: PathBuf,
        /// Existing, cleanly-closed-or-interrupted container to resume
        container: PathBuf,
        #[arg(long)]
        parallelism: Option<usize>,
        #[arg(long, default_value = "2")]
        pipeline_depth: usize,
    },
    /// Verify an image container's chunk digests
    Verify {
        container: PathBuf,
        /// Sample a stride of chunks instead of checking every one
        #[arg(long)]
        quick: bool,
        #[arg(long, default_value = "4")]
        parallelism: usize,
    },
    /// Read a byte range out of an image container
    Read {
        container: PathBuf,
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        length: usize,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show header and index summary
    Info {
        container: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {
        Commands::Capture { source, output, chunk_size, sector_size, fs_tag, parallelism, pipeline_depth } => {
            let reader = FileBlockReader::open(&source, sector_size)?;
            let device_length = reader.total_size();
            let cfg = CaptureConfig {
                chunk_size,
                parallelism: parallelism.unwrap_or_else(|| (num_cpus::get() / 2).max(1)),
                pipeline_depth,
            }
            .normalized();

            let mut writer = Writer::new(&output, sector_size, chunk_size, device_length, &fs_tag)?;
            let (chunks, last_offset) = writer.write_from(
                &reader,
                0,
                None,
                0,
                &mut |chunks, bytes| {
                    println!("  captured {chunks} chunk(s), {bytes} byte(s)");
                },
                cfg.parallelism,
                cfg.pipeline_depth,
            )?;
            writer.close()?;
            println!("Captured {chunks} chunk(s) up to device offset {last_offset} -> {}", output.display());
        }

        Commands::Resume { source, container, parallelism, pipeline_depth } => {
            let reader = FileBlockReader::open(&source, 512)?;
            let (mut writer, next_offset, next_index) = Writer::open_for_resume(&container)?;
            println!("Resuming at device offset {next_offset}, chunk index {next_index}");

            let parallelism = parallelism.unwrap_or_else(|| (num_cpus::get() / 2).max(1));
            let (chunks, last_offset) = writer.write_from(
                &reader,
                next_offset,
                None,
                next_index,
                &mut |chunks, bytes| {
                    println!("  captured {chunks} chunk(s), {bytes} byte(s)");
                },
                parallelism,
                pipeline_depth,
            )?;
            writer.close()?;
            println!("Resume complete: {chunks} total chunk(s), last device offset {last_offset}");
        }

        Commands::Verify { container, quick, parallelism } => {
            let reader = Reader::open(&container)?;
            let mut progress = |done: u64, total: u64| {
                println!("  verified {done}/{total} byte(s)");
            };
            let failure = if quick {
                reader.verify_quick(&mut progress, parallelism)
            } else {
                reader.verify_full(&mut progress, parallelism)
            };
            match failure {
                None => println!("OK: {} passed {} verification", container.display(), if quick { "quick" } else { "full" }),
                Some(f) => {
                    println!("FAILED: chunk {} — {:?}", f.chunk_index, f.kind);
                    std::process::exit(1);
                }
            }
        }

        Commands::Read { container, offset, length, out } => {
            let reader = Reader::open(&container)?;
            let mut buf = vec![0u8; length];
            let n = reader.read(offset, &mut buf, length)?;
            buf.truncate(n);
            match out {
                Some(path) => {
                    std::fs::write(&path, &buf)?;
                    println!("Wrote {} byte(s) to {}", buf.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&buf)?;
                }
            }
        }

        Commands::Info { container } => {
            let reader = Reader::open(&container)?;
            println!("── image container ──────────────────────────────────────");
            println!("  Path          {}", container.display());
            println!("  Device length {} B", reader.device_length());
            println!("  Sector size   {} B", reader.sector_size());
            println!("  Chunk size    {} B", reader.chunk_size());
            println!("  Index entries {}", reader.entries().len());
        }
    }

    Ok(())
}
