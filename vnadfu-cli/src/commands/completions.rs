//! Shell completion generation and installation.

use {
    crate::Cli,
    anyhow::{Context, Result},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    console::style,
    std::{
        env, fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
    },
};

const ZSH_FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

/// Render the completion script for `shell`.
fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Shell name from a `$SHELL`-style path.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())?;
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn home_dir() -> Result<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

/// `$XDG_<var>` or `$HOME/<fallback>`.
fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
    env::var(var).map_or_else(
        |_| {
            fallback
                .iter()
                .fold(home_dir().unwrap_or_default(), |dir, part| dir.join(part))
        },
        PathBuf::from,
    )
}

/// Where the completion script for `shell` is installed.
fn install_path(shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => xdg_dir("XDG_DATA_HOME", &[".local", "share"])
            .join("bash-completion/completions/vnadfu"),
        Shell::Zsh => home_dir()?.join(".zfunc/_vnadfu"),
        Shell::Fish => {
            xdg_dir("XDG_CONFIG_HOME", &[".config"]).join("fish/completions/vnadfu.fish")
        },
        Shell::Elvish => xdg_dir("XDG_CONFIG_HOME", &[".config"]).join("elvish/lib/vnadfu.elv"),
        Shell::PowerShell => match env::var("PROFILE") {
            Ok(profile) => Path::new(&profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
                .join("vnadfu.ps1"),
            Err(_) => home_dir()?.join(".config/powershell/completions/vnadfu.ps1"),
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Add `~/.zfunc` to the zsh function path unless `zshrc` already does.
///
/// Returns whether the file was changed.
fn ensure_zsh_fpath(zshrc: &Path) -> Result<bool> {
    let present = fs::read_to_string(zshrc).is_ok_and(|content| content.contains(ZSH_FPATH_LINE));
    if present {
        return Ok(false);
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# vnadfu completions")?;
    writeln!(file, "{ZSH_FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    Ok(true)
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             vnadfu completions --install bash",
        )?,
    };

    let path = install_path(shell)?;
    let mut script = Vec::new();
    render(shell, &mut script);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );
    eprintln!();

    match shell {
        Shell::Bash => eprintln!(
            "Completions load on new terminals. To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => {
            let zshrc = home_dir()?.join(".zshrc");
            if ensure_zsh_fpath(&zshrc)? {
                eprintln!(
                    "{} Added fpath to {}",
                    style("✓").green().bold(),
                    style(zshrc.display()).yellow()
                );
            }
            eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => eprintln!(
            "Add this to your PowerShell profile to load on startup:\n  {}",
            style(format!("Import-Module {}", path.display())).cyan()
        ),
        _ => eprintln!("Completions load automatically in new sessions."),
    }

    Ok(())
}
