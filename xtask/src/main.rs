//! Workspace task runner: builds the layer shared object and keeps
//! the loader manifest in sync with the symbols the crate exports.
//!
//! The manifest is generated from `framepace_layer::entry`'s constant
//! tables, so the checked-in JSON can never silently drift from the
//! binary. `cargo xtask verify-manifest` is the drift check.

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

use framepace_layer::ash::vk;
use framepace_layer::entry;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const MANIFEST_RELATIVE: &str =
    "framepace-layer/layer/VkLayer_framepace_frame_doubler.json";
const LIBRARY_NAME: &str = "libframepace_layer.so";

// ----------------------------------------------------------------
// Entry point
// ----------------------------------------------------------------

fn main() {
    if let Err(e) = try_main() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    match env::args().nth(1).as_deref() {
        Some(task) => execute_graph(task),
        None => {
            eprintln!("Usage: cargo xtask <task>\n");
            eprintln!("Tasks:");
            for task in &all_tasks() {
                eprintln!("  {}", task.name);
            }
            std::process::exit(1);
        }
    }
}

// ----------------------------------------------------------------
// Task graph
// ----------------------------------------------------------------

struct Task {
    name: &'static str,
    deps: &'static [&'static str],
    run: fn() -> Result<()>,
}

fn noop() -> Result<()> {
    Ok(())
}

fn all_tasks() -> Vec<Task> {
    vec![
        Task {
            name: "build",
            deps: &[],
            run: cargo_build,
        },
        Task {
            name: "manifest",
            deps: &[],
            run: write_manifest,
        },
        Task {
            name: "verify-manifest",
            deps: &[],
            run: verify_manifest,
        },
        Task {
            name: "copy-dist",
            deps: &["build", "verify-manifest"],
            run: copy_dist,
        },
        Task {
            name: "dist",
            deps: &["build", "verify-manifest", "copy-dist"],
            run: noop,
        },
    ]
}

#[derive(Clone, Copy, PartialEq)]
enum Status {
    Succeeded,
    Failed,
    Skipped,
}

fn task_index(tasks: &[Task], name: &str) -> Result<usize> {
    tasks
        .iter()
        .position(|t| t.name == name)
        .ok_or_else(|| format!("unknown task: `{name}`").into())
}

fn collect_topo(
    tasks: &[Task],
    name: &str,
    visited: &mut Vec<bool>,
    order: &mut Vec<usize>,
) -> Result<()> {
    let idx = task_index(tasks, name)?;
    if visited[idx] {
        return Ok(());
    }
    visited[idx] = true;
    for &dep in tasks[idx].deps {
        collect_topo(tasks, dep, visited, order)?;
    }
    order.push(idx);
    Ok(())
}

fn execute_graph(target: &str) -> Result<()> {
    let tasks = all_tasks();
    let mut visited = vec![false; tasks.len()];
    let mut order: Vec<usize> = Vec::new();
    collect_topo(&tasks, target, &mut visited, &mut order)?;

    let mut statuses: Vec<Option<Status>> = vec![None; tasks.len()];

    for &idx in &order {
        let task = &tasks[idx];
        let blocked = task.deps.iter().any(|&dep| {
            let dep_idx = tasks.iter().position(|t| t.name == dep).unwrap();
            matches!(statuses[dep_idx], Some(Status::Failed | Status::Skipped))
        });

        if blocked {
            eprintln!("skip: {}", task.name);
            statuses[idx] = Some(Status::Skipped);
            continue;
        }

        match (task.run)() {
            Ok(()) => statuses[idx] = Some(Status::Succeeded),
            Err(e) => {
                eprintln!("failed: {}: {e}", task.name);
                statuses[idx] = Some(Status::Failed);
            }
        }
    }

    let failed: Vec<&str> = order
        .iter()
        .filter(|&&i| statuses[i] == Some(Status::Failed))
        .map(|&i| tasks[i].name)
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        Err(
            format!("{} task(s) failed: {}", failed.len(), failed.join(", "))
                .into(),
        )
    }
}

// ----------------------------------------------------------------
// Task implementations
// ----------------------------------------------------------------

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("xtask has a parent directory")
        .to_path_buf()
}

fn run(cmd: &mut Command) -> Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        return Err(format!(
            "command {:?} failed with {}",
            cmd.get_program(),
            status
        )
        .into());
    }
    Ok(())
}

fn cargo_build() -> Result<()> {
    let root = workspace_root();
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    run(Command::new(cargo)
        .args(["build", "--release", "-p", "framepace-layer"])
        .current_dir(&root))
}

/// The manifest document, derived from the layer's own constants.
fn manifest_value() -> Result<serde_json::Value> {
    let spec = entry::LAYER_SPEC_VERSION;
    let api_version = format!(
        "{}.{}.{}",
        vk::api_version_major(spec),
        vk::api_version_minor(spec),
        vk::api_version_patch(spec),
    );

    let mut functions = serde_json::Map::new();
    for (vk_name, symbol) in entry::EXPORTED_SYMBOLS {
        functions.insert(
            (*vk_name).to_string(),
            serde_json::Value::String((*symbol).to_string()),
        );
    }

    Ok(serde_json::json!({
        "file_format_version": "1.1.0",
        "layer": {
            "name": entry::LAYER_NAME.to_str()?,
            "type": "GLOBAL",
            "library_path": LIBRARY_NAME,
            "api_version": api_version,
            "implementation_version":
                entry::LAYER_IMPLEMENTATION_VERSION.to_string(),
            "description": entry::LAYER_DESCRIPTION.to_str()?,
            "functions": functions,
        }
    }))
}

fn write_manifest() -> Result<()> {
    let path = workspace_root().join(MANIFEST_RELATIVE);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(&manifest_value()?)?;
    text.push('\n');
    fs::write(&path, text)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn verify_manifest() -> Result<()> {
    let path = workspace_root().join(MANIFEST_RELATIVE);
    let on_disk: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path)?)?;
    if on_disk != manifest_value()? {
        return Err(format!(
            "{} is out of date; run `cargo xtask manifest`",
            path.display()
        )
        .into());
    }
    println!("Manifest up to date");
    Ok(())
}

fn copy_dist() -> Result<()> {
    let root = workspace_root();
    let out_dir = root.join("target").join("dist");
    fs::create_dir_all(&out_dir)?;

    let library = root.join("target").join("release").join(LIBRARY_NAME);
    fs::copy(&library, out_dir.join(LIBRARY_NAME))?;

    let manifest = root.join(MANIFEST_RELATIVE);
    let manifest_name = manifest
        .file_name()
        .ok_or("manifest path has no file name")?
        .to_owned();
    fs::copy(&manifest, out_dir.join(manifest_name))?;

    println!("Dist files in {}", out_dir.display());
    Ok(())
}
