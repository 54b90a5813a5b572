use bytesize::ByteSize;
use eyre_pretty::{Context, Result, eyre};
use quartz::{
    Config, Console,
    fs::{ArchiveBuilder, DirEntry},
    modules::{Modules, TracingDebugModule},
};
use std::{io::Write, path::PathBuf};

fn list(console: &Console, dir: &str, depth: usize) -> Result<()> {
    let entries: Vec<DirEntry> = console.fs_read_dir(dir)?;
    for entry in entries {
        let path = if dir.is_empty() {
            entry.name.clone()
        } else {
            format!("{dir}/{}", entry.name)
        };

        if entry.is_dir {
            println!("{:indent$}{}/", "", entry.name, indent = depth * 2);
            list(console, &path, depth + 1)?;
        } else {
            println!(
                "{:indent$}{} ({})",
                "",
                entry.name,
                ByteSize::b(entry.size as u64),
                indent = depth * 2
            );
        }
    }

    Ok(())
}

pub fn inspect(input: PathBuf, cat: Option<String>) -> Result<()> {
    let cartridge = std::fs::read(&input).context("reading archive")?;
    let mut console = Console::new(
        Modules {
            debug: Box::new(TracingDebugModule),
        },
        Config {
            cartridge,
            ..Default::default()
        },
    )
    .context("creating console")?;

    let count = console.fs_init(0).context("mounting archive")?;
    let Some(target) = cat else {
        println!("{} entries", count);
        return list(&console, "", 0);
    };

    let file = console
        .fs_open(&target)
        .map_err(|e| eyre!("opening {target}: {e}"))?;

    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0; 16 * bytesize::KIB as usize];
    loop {
        let read = console.fs_read(file, &mut buf)?;
        if read == 0 {
            break;
        }

        stdout.write_all(&buf[..read])?;
    }

    console.fs_close(file)?;
    console.fs_unmount()?;

    Ok(())
}

pub fn pack(output: PathBuf, files: Vec<PathBuf>, root: PathBuf) -> Result<()> {
    let mut builder = ArchiveBuilder::new();
    for path in files {
        let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .strip_prefix(&root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");

        tracing::info!(%name, size = data.len(), "adding file");
        builder.add(name, data)?;
    }

    let image = builder.build();
    std::fs::write(&output, &image).context("writing archive")?;
    println!(
        "packed {} files into {}",
        builder.len(),
        ByteSize::b(image.len() as u64)
    );

    Ok(())
}
