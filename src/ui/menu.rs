use crate::engine::repository::CloneOutcome;
use crate::engine::{Engine, Session, Step, Workflow};
use crate::ui::{
    print_header, print_info, print_success, print_warning, report_error, show_health, show_info,
    show_summary, symbols,
};
use owo_colors::{OwoColorize, Stream};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::debug;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Category {
    Main,
    Setup,
    Build,
    Maintenance,
}

impl Category {
    pub fn title(&self) -> (&'static str, &'static str) {
        match self {
            Category::Main => ("MAIN MENU", "Build and deploy"),
            Category::Setup => ("SETUP & INSTALL", "Cloning and toolchain installation"),
            Category::Build => ("BUILD & PACKAGE", "Building and packaging"),
            Category::Maintenance => ("MAINTENANCE", "Cleanup and diagnostics"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Danger {
    Safe,
    Warning,
    Danger,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Action {
    CompleteSetup,
    Open(Category),
    SystemInfo,
    Exit,
    CloneRepository,
    CheckRepository,
    Run(Step),
    QuickBuild,
    CleanupTemp,
    ForceReinstallNode,
    ForceReinstallPnpm,
    ResetRepository,
    ResetAll,
    HealthCheck,
}

#[derive(Debug)]
pub struct MenuItem {
    pub key: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub action: Action,
    pub danger: Danger,
    pub estimated_time: Option<&'static str>,
    pub requires_confirmation: bool,
}

const fn item(
    key: &'static str,
    title: &'static str,
    description: &'static str,
    action: Action,
    estimated_time: Option<&'static str>,
) -> MenuItem {
    MenuItem {
        key,
        title,
        description,
        action,
        danger: Danger::Safe,
        estimated_time,
        requires_confirmation: false,
    }
}

const fn guarded(mut item: MenuItem, danger: Danger) -> MenuItem {
    item.danger = danger;
    item.requires_confirmation = true;
    item
}

const BACK: MenuItem = item(
    "back",
    "Back to main menu",
    "Return to the main menu",
    Action::Open(Category::Main),
    None,
);

const MAIN: &[MenuItem] = &[
    item(
        "setup_complete",
        "Complete automatic setup",
        "Clone + Node.js + pnpm + build + package",
        Action::CompleteSetup,
        Some("5-8min"),
    ),
    item(
        "step_by_step",
        "Step by step setup",
        "Run each step individually",
        Action::Open(Category::Setup),
        Some("8-15min"),
    ),
    item(
        "build_only",
        "Build and package only",
        "When the repository already exists",
        Action::Open(Category::Build),
        Some("3-5min"),
    ),
    item(
        "maintenance",
        "Maintenance & cleanup",
        "Cleanup, reinstall and diagnostics",
        Action::Open(Category::Maintenance),
        Some("< 1min"),
    ),
    item(
        "info",
        "System information",
        "Paths, versions and statistics",
        Action::SystemInfo,
        Some("< 1min"),
    ),
    item("exit", "Exit", "Quit the program", Action::Exit, None),
];

const SETUP: &[MenuItem] = &[
    item(
        "clone_repo",
        "Clone repository",
        "git clone + permission setup",
        Action::CloneRepository,
        Some("1-2min"),
    ),
    item(
        "install_node",
        "Install/verify Node.js",
        "Download and install the latest LTS locally",
        Action::Run(Step::Node),
        Some("1-2min"),
    ),
    item(
        "install_pnpm",
        "Install/verify pnpm",
        "Install the pnpm package manager locally",
        Action::Run(Step::Pnpm),
        Some("30s"),
    ),
    item(
        "build_project",
        "Run build",
        "Install dependencies and build the project",
        Action::Run(Step::Build),
        Some("2-3min"),
    ),
    item(
        "create_package",
        "Create package",
        "Zip the build output with the runtime",
        Action::Run(Step::Package),
        Some("30s"),
    ),
    BACK,
];

const BUILD: &[MenuItem] = &[
    item(
        "check_repo",
        "Check repository",
        "Verify the checkout exists and is valid",
        Action::CheckRepository,
        Some("10s"),
    ),
    item(
        "build_project",
        "Run build",
        "Install dependencies and build the project",
        Action::Run(Step::Build),
        Some("2-3min"),
    ),
    item(
        "create_package",
        "Create package",
        "Zip the build output with the runtime",
        Action::Run(Step::Package),
        Some("30s"),
    ),
    item(
        "quick_build",
        "Quick build + package",
        "Provision, build and package in one go",
        Action::QuickBuild,
        Some("2-4min"),
    ),
    BACK,
];

const MAINTENANCE: &[MenuItem] = &[
    item(
        "cleanup",
        "Remove temporary files",
        "Delete downloads and temporary files",
        Action::CleanupTemp,
        Some("< 30s"),
    ),
    guarded(
        item(
            "force_reinstall_node",
            "Reinstall Node.js",
            "Remove and install Node.js again",
            Action::ForceReinstallNode,
            Some("1-2min"),
        ),
        Danger::Warning,
    ),
    guarded(
        item(
            "force_reinstall_pnpm",
            "Reinstall pnpm",
            "Remove and install pnpm again",
            Action::ForceReinstallPnpm,
            Some("30s"),
        ),
        Danger::Warning,
    ),
    guarded(
        item(
            "reset_repo",
            "Reset repository",
            "Remove the cloned repository",
            Action::ResetRepository,
            Some("2-3min"),
        ),
        Danger::Danger,
    ),
    guarded(
        item(
            "reset_all",
            "Reset everything",
            "Remove everything and start over (CAREFUL!)",
            Action::ResetAll,
            Some("1min"),
        ),
        Danger::Danger,
    ),
    item(
        "check_health",
        "Health check",
        "Verify every installed component",
        Action::HealthCheck,
        Some("30s"),
    ),
    BACK,
];

pub fn items(category: Category) -> &'static [MenuItem] {
    match category {
        Category::Main => MAIN,
        Category::Setup => SETUP,
        Category::Build => BUILD,
        Category::Maintenance => MAINTENANCE,
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Choice {
    Item(usize),
    Quit,
    Invalid,
}

/// Parses a 1-based menu selection.
pub fn parse_choice(input: &str, len: usize) -> Choice {
    let input = input.trim().to_lowercase();
    if input == "q" || input == "quit" {
        return Choice::Quit;
    }

    match input.parse::<usize>() {
        Ok(n) if n >= 1 && n <= len => Choice::Item(n - 1),
        _ => Choice::Invalid,
    }
}

fn is_yes(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Menu<'e, R> {
    engine: &'e Engine,
    session: Session,
    input: Lines<R>,
    category: Category,
    assume_yes: bool,
}

impl<'e, R: AsyncBufRead + Unpin> Menu<'e, R> {
    pub fn new(engine: &'e Engine, session: Session, input: R, assume_yes: bool) -> Self {
        Menu {
            engine,
            session,
            input: input.lines(),
            category: Category::Main,
            assume_yes,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn read_line(&mut self, prompt: &str) -> anyhow::Result<Option<String>> {
        print!("{}", prompt.if_supports_color(Stream::Stdout, |s| s.cyan()));
        std::io::stdout().flush()?;

        Ok(self.input.next_line().await?)
    }

    /// End of input counts as "no".
    pub async fn confirm(&mut self, message: &str) -> anyhow::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }

        let prompt = format!("{} {} [y/N] ", symbols::WARNING, message);
        Ok(self
            .read_line(&prompt)
            .await?
            .map(|answer| is_yes(&answer))
            .unwrap_or(false))
    }

    fn render(&self) {
        let (title, subtitle) = self.category.title();
        print_header(title, subtitle);

        for (i, item) in items(self.category).iter().enumerate() {
            let number = format!("{:>2}.", i + 1);
            let title = match item.danger {
                Danger::Safe => item
                    .title
                    .if_supports_color(Stream::Stdout, |s| s.bold())
                    .to_string(),
                Danger::Warning => item
                    .title
                    .if_supports_color(Stream::Stdout, |s| s.yellow())
                    .to_string(),
                Danger::Danger => item
                    .title
                    .if_supports_color(Stream::Stdout, |s| s.red())
                    .to_string(),
            };

            match item.estimated_time {
                Some(time) => println!("{} {} ({})", number, title, time),
                None => println!("{} {}", number, title),
            }
            println!(
                "     {}",
                item.description
                    .if_supports_color(Stream::Stdout, |s| s.dimmed())
            );
        }
    }

    /// Runs until the user quits or input ends.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.render();

            let line = match self.read_line("\nChoose an option (q to quit): ").await? {
                Some(line) => line,
                None => return Ok(()),
            };

            let entries = items(self.category);
            let item = match parse_choice(&line, entries.len()) {
                Choice::Quit => return Ok(()),
                Choice::Invalid => {
                    print_warning("Invalid option");
                    continue;
                }
                Choice::Item(i) => &entries[i],
            };

            debug!(item = item.key, "menu selection");

            if item.requires_confirmation {
                let question = format!("{}: are you sure?", item.title);
                if !self.confirm(&question).await? {
                    print_warning("Cancelled");
                    continue;
                }
            }

            match self.perform(item.action).await {
                Ok(Flow::Exit) => return Ok(()),
                Ok(Flow::Continue) => {}
                Err(e) => report_error(&e),
            }
        }
    }

    pub async fn perform(&mut self, action: Action) -> anyhow::Result<Flow> {
        let engine = self.engine;

        match action {
            Action::Open(category) => self.category = category,
            Action::Exit => {
                print_success("Goodbye!");
                return Ok(Flow::Exit);
            }
            Action::SystemInfo => show_info(engine, &self.session.stats),
            Action::HealthCheck => show_health(&engine.health_check(&self.session).await),

            Action::CompleteSetup => {
                if !self
                    .confirm("Run the complete setup (clone + build + package)?")
                    .await?
                {
                    print_warning("Cancelled");
                    return Ok(Flow::Continue);
                }

                self.session.stats.steps.clear();
                engine
                    .run_workflow(&mut self.session, &Workflow::complete())
                    .await?;
                show_summary(&self.session.stats);
                print_success("All steps finished");
            }

            Action::QuickBuild => {
                if !self.confirm("Build and package now?").await? {
                    print_warning("Cancelled");
                    return Ok(Flow::Continue);
                }

                engine.check_repository(&mut self.session).await?;
                self.session.stats.steps.clear();
                engine
                    .run_workflow(&mut self.session, &Workflow::quick())
                    .await?;
                show_summary(&self.session.stats);
            }

            Action::CloneRepository => {
                match engine.clone_repository(&mut self.session, false).await? {
                    CloneOutcome::Cloned => print_success("Repository cloned"),
                    CloneOutcome::AlreadyPresent => {
                        let replace = self
                            .confirm("The repository already exists. Remove it and clone again?")
                            .await?;
                        if replace {
                            engine.clone_repository(&mut self.session, true).await?;
                            print_success("Repository cloned");
                        } else {
                            print_info("Keeping the existing repository");
                        }
                    }
                }
            }

            Action::CheckRepository => {
                let repo = engine.check_repository(&mut self.session).await?;
                print_success(&format!("{} is ready to build", repo.display()));
            }

            Action::Run(step) => {
                engine.run_step(&mut self.session, step, false).await?;
                print_success(&format!("Step '{}' finished", step));
            }

            Action::CleanupTemp => {
                let removed = engine.cleanup_temp_files().await?;
                print_success(&format!("Removed {} temporary files", removed));
            }

            Action::ForceReinstallNode => {
                let state = engine.force_reinstall_node(&mut self.session).await?;
                print_success(&format!(
                    "Node.js {} reinstalled",
                    state.version.unwrap_or_default()
                ));
            }

            Action::ForceReinstallPnpm => {
                let state = engine.force_reinstall_pnpm(&mut self.session).await?;
                print_success(&format!(
                    "pnpm {} reinstalled",
                    state.version.unwrap_or_default()
                ));
            }

            Action::ResetRepository => {
                if engine.reset_repository(&mut self.session).await? {
                    print_success("Repository removed");
                } else {
                    print_info("No repository to remove");
                }
            }

            Action::ResetAll => {
                if !self.confirm("LAST CONFIRMATION: remove everything?").await? {
                    print_warning("Cancelled at the final confirmation");
                    return Ok(Flow::Continue);
                }

                let removed = engine.reset_all(&mut self.session).await?;
                print_success(&format!("Reset complete, {} entries removed", removed));
            }
        }

        Ok(Flow::Continue)
    }
}
