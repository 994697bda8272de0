use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use spgz_core::{CompFile, OpenMode};

#[derive(Parser)]
#[command(
    name = "spgz",
    about = "Compressed sparse block store — compress a file into SPGZ, or extract it back out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a source file (or stdin) into a newly created SPGZ file
    Compress {
        /// Source file to compress ("-" reads stdin)
        input: PathBuf,
        /// Destination SPGZ file; must not already exist
        output: PathBuf,
        /// Logical block size in bytes; rounded up to the nearest 4 KiB and
        /// reduced by one, matching the format's `B = U*4096 - 1` layout
        #[arg(short, long)]
        block_size: Option<u64>,
    },
    /// Read an SPGZ file in full and write its logical content to a target
    Extract {
        /// Source SPGZ file
        input: PathBuf,
        /// Destination file or block device
        output: PathBuf,
        /// Emit every byte verbatim instead of re-sparsifying zero runs on
        /// the output file
        #[arg(long)]
        no_sparse: bool,
    },
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

/// Round a requested block size in bytes to the nearest valid `U` (units of
/// 4 KiB), per the format's `B = U*4096 - 1` constraint.
fn block_size_units(requested_bytes: u64) -> u32 {
    let units = ((requested_bytes + 1) + 4095) / 4096;
    units.max(1) as u32
}

fn is_block_device(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// Write `data` to `dst` at the current position, skipping runs of zero
/// bytes via `seek` so the output file stays sparse instead of materializing
/// the zeros (the `--no-sparse` flag bypasses this and writes everything).
fn write_sparse(dst: &mut File, data: &[u8]) -> anyhow::Result<()> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0 {
            let start = i;
            while i < data.len() && data[i] == 0 {
                i += 1;
            }
            dst.seek(io::SeekFrom::Current((i - start) as i64))?;
        } else {
            let start = i;
            while i < data.len() && data[i] != 0 {
                i += 1;
            }
            dst.write_all(&data[start..i])?;
        }
    }
    Ok(())
}

fn run_compress(input: PathBuf, output: PathBuf, block_size: Option<u64>) -> anyhow::Result<()> {
    let mode = OpenMode::create_new();
    let mut cf = match block_size {
        Some(bytes) => CompFile::open_with_block_size(&output, mode, block_size_units(bytes))
            .with_context(|| format!("creating output file {:?}", output))?,
        None => {
            CompFile::open(&output, mode).with_context(|| format!("creating output file {:?}", output))?
        }
    };

    let t0 = Instant::now();
    let mut total_raw = 0u64;

    if input.to_str() == Some("-") {
        let stdin = io::stdin();
        let mut src = stdin.lock();
        let mut buf = vec![0u8; cf.block_size() as usize];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            cf.copy_in(&buf[..n])?;
            total_raw += n as u64;
        }
    } else {
        let mut src = File::open(&input).with_context(|| format!("opening input file {:?}", input))?;
        let mut buf = vec![0u8; cf.block_size() as usize];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            cf.copy_in(&buf[..n])?;
            total_raw += n as u64;
        }
    }

    cf.close()?;
    let elapsed = t0.elapsed();
    let compressed_size = std::fs::metadata(&output)?.len();

    eprintln!("  block size  : {}", human_bytes(cf.block_size() + 1));
    eprintln!("  raw size    : {}", human_bytes(total_raw));
    eprintln!("  on disk     : {}", human_bytes(compressed_size));
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_extract(input: PathBuf, output: PathBuf, no_sparse: bool) -> anyhow::Result<()> {
    let mut cf = CompFile::open(&input, OpenMode::read_only())
        .with_context(|| format!("opening input file {:?}", input))?;
    let size = cf.size()?;

    let target_is_device = is_block_device(&output);
    if target_is_device {
        let dev_size = std::fs::metadata(&output)
            .with_context(|| format!("stat'ing target device {:?}", output))?
            .len();
        if dev_size != size {
            anyhow::bail!(
                "target device {:?} is {} bytes, but source logical size is {} bytes",
                output,
                dev_size,
                size
            );
        }
    }

    let mut dst = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(!target_is_device)
        .open(&output)
        .with_context(|| format!("opening output target {:?}", output))?;
    if !target_is_device {
        dst.set_len(0)?;
    }

    let t0 = Instant::now();
    let mut buf = vec![0u8; cf.block_size() as usize];
    let mut total = 0u64;
    loop {
        let n = cf.copy_out(&mut buf)?;
        if n == 0 {
            break;
        }
        if no_sparse {
            dst.write_all(&buf[..n])?;
        } else {
            write_sparse(&mut dst, &buf[..n])?;
        }
        total += n as u64;
    }
    // A trailing run of skipped zeros still needs to land at the right length.
    if !target_is_device {
        dst.set_len(total)?;
    }
    dst.flush()?;

    let elapsed = t0.elapsed();
    eprintln!("  raw size    : {}", human_bytes(total));
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Compress {
            input,
            output,
            block_size,
        } => run_compress(input, output, block_size),
        Commands::Extract {
            input,
            output,
            no_sparse,
        } => run_extract(input, output, no_sparse),
    };

    // Argument-parsing usage errors are handled by `Cli::parse()` above,
    // which already exits with code 2 before `main` reaches this point.
    // Anything that fails here is a runtime I/O failure.
    if let Err(err) = result {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
