#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate env_logger;

use std::collections::BTreeMap;
use std::process;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use paasd_controller::{
    AppLifecycle, ControllerConfig, DeployOrchestrator, EntityStore, HealthChecker, InMemoryKv,
    InMemoryStore, ReleaseEngine, ReqwestHealthChecker, ResourceManager,
};
use paasd_definitions::{Build, ConfigPatch, Error, Result, Stack};
use paasd_scheduler::fake::FakeScheduler;
use paasd_scheduler::Scheduler;

/// The long-lived deps a command dispatches against, built once in `main`
/// and borrowed by every subcommand - the CLI equivalent of `raftcat`'s
/// shared `Controller` struct (there held behind an `Arc`; a single
/// short-lived CLI process has no concurrent requests to share it with).
struct Runtime {
    scheduler: Box<dyn Scheduler>,
    store: InMemoryStore,
    kv: InMemoryKv,
    health: Box<dyn HealthChecker>,
    config: ControllerConfig,
}

impl Runtime {
    async fn new() -> Result<Self> {
        let scheduler: Box<dyn Scheduler> = if std::env::var("PAASD_USE_KUBE").is_ok() {
            Box::new(
                paasd_scheduler::kube_backend::KubeScheduler::new()
                    .await
                    .map_err(|e| paasd_definitions::ErrorKind::ServiceUnavailable(e.to_string()))?,
            )
        } else {
            Box::new(FakeScheduler::new())
        };
        Ok(Runtime {
            scheduler,
            store: InMemoryStore::new(),
            kv: InMemoryKv::new(),
            health: Box::new(ReqwestHealthChecker::default()),
            config: ControllerConfig::from_env(),
        })
    }

    fn lifecycle(&self) -> AppLifecycle {
        AppLifecycle::new(&*self.scheduler, &self.store, &self.kv)
    }

    fn releases(&self) -> ReleaseEngine {
        ReleaseEngine::new(&self.store, &self.kv)
    }

    fn deploy(&self) -> DeployOrchestrator {
        DeployOrchestrator::with_config(&*self.scheduler, &self.store, &self.kv, &*self.health, &self.config)
    }

    fn resources(&self) -> ResourceManager {
        ResourceManager::new(&*self.scheduler, &self.store)
    }
}

fn print_error_debug(e: &Error) {
    for cause in e.iter().skip(1) {
        warn!("caused by: {}", cause);
    }
}

#[tokio::main]
async fn main() {
    let args = cli().get_matches();
    env_logger::Builder::new()
        .filter_level(match args.occurrences_of("verbose") {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init();

    let rt = match Runtime::new().await {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to initialise: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = dispatch_commands(&args, &rt).await {
        error!("error: {}", e);
        print_error_debug(&e);
        process::exit(1);
    }
}

fn cli() -> App<'static, 'static> {
    App::new("paasd")
        .version(crate_version!())
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::ColoredHelp)
        .about("Control-plane CLI for pushing, releasing and scaling apps")
        .arg(Arg::with_name("verbose").short("v").multiple(true).help("Increase verbosity"))
        .subcommand(
            SubCommand::with_name("apps")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .about("Manage apps")
                .subcommand(
                    SubCommand::with_name("create")
                        .arg(Arg::with_name("id").help("Requested app id, random if omitted"))
                        .arg(Arg::with_name("owner").long("owner").takes_value(true).required(true)),
                )
                .subcommand(SubCommand::with_name("list"))
                .subcommand(SubCommand::with_name("delete").arg(Arg::with_name("app").required(true))),
        )
        .subcommand(
            SubCommand::with_name("build")
                .about("Push a new build for an app")
                .arg(Arg::with_name("app").required(true))
                .arg(Arg::with_name("owner").long("owner").takes_value(true).required(true))
                .arg(Arg::with_name("image").required(true))
                .arg(Arg::with_name("sha").long("sha").takes_value(true).default_value("")),
        )
        .subcommand(
            SubCommand::with_name("config")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .about("App configuration")
                .subcommand(SubCommand::with_name("show").arg(Arg::with_name("app").required(true)))
                .subcommand(
                    SubCommand::with_name("set")
                        .arg(Arg::with_name("app").required(true))
                        .arg(Arg::with_name("owner").long("owner").takes_value(true).required(true))
                        .arg(
                            Arg::with_name("pair")
                                .required(true)
                                .multiple(true)
                                .help("KEY=value pairs to set"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("unset")
                        .arg(Arg::with_name("app").required(true))
                        .arg(Arg::with_name("owner").long("owner").takes_value(true).required(true))
                        .arg(Arg::with_name("key").required(true).multiple(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("releases")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .about("Release history")
                .subcommand(SubCommand::with_name("list").arg(Arg::with_name("app").required(true)))
                .subcommand(
                    SubCommand::with_name("rollback")
                        .arg(Arg::with_name("app").required(true))
                        .arg(Arg::with_name("owner").long("owner").takes_value(true).required(true))
                        .arg(Arg::with_name("version").required(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("deploy")
                .about("Deploy the latest release of an app")
                .arg(Arg::with_name("app").required(true))
                .arg(Arg::with_name("force").long("force"))
                .arg(Arg::with_name("rolling").long("rolling")),
        )
        .subcommand(
            SubCommand::with_name("ps")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .about("Process management")
                .subcommand(
                    SubCommand::with_name("scale")
                        .arg(Arg::with_name("app").required(true))
                        .arg(
                            Arg::with_name("pair")
                                .required(true)
                                .multiple(true)
                                .help("ptype=count pairs"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("restart")
                        .arg(Arg::with_name("app").required(true))
                        .arg(Arg::with_name("ptype").required(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a one-off command against the latest release")
                .arg(Arg::with_name("app").required(true))
                .arg(Arg::with_name("ptype").long("ptype").takes_value(true).default_value("web"))
                .setting(AppSettings::TrailingVarArg)
                .arg(Arg::with_name("cmd").required(true).multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("resources")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .about("Provisioned resources (service-catalog backed)")
                .subcommand(
                    SubCommand::with_name("bind")
                        .arg(Arg::with_name("app").required(true))
                        .arg(Arg::with_name("name").required(true)),
                )
                .subcommand(
                    SubCommand::with_name("unbind")
                        .arg(Arg::with_name("app").required(true))
                        .arg(Arg::with_name("name").required(true)),
                ),
        )
}

fn owner_of<'a>(a: &'a ArgMatches) -> &'a str {
    a.value_of("owner").unwrap_or("cli")
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    let idx = pair
        .find('=')
        .ok_or_else(|| paasd_definitions::ErrorKind::Validation(format!("{} is not KEY=value", pair)))?;
    Ok((&pair[..idx], &pair[idx + 1..]))
}

async fn dispatch_commands(args: &ArgMatches<'_>, rt: &Runtime) -> Result<()> {
    if let Some(a) = args.subcommand_matches("apps") {
        if let Some(c) = a.subcommand_matches("create") {
            let app = rt.lifecycle().create(c.value_of("id").map(String::from), owner_of(c)).await?;
            println!("{}", app.id);
            return Ok(());
        }
        if a.subcommand_matches("list").is_some() {
            for app in rt.store.list_apps().await? {
                println!("{}", app.id);
            }
            return Ok(());
        }
        if let Some(c) = a.subcommand_matches("delete") {
            let app = rt.store.get_app(c.value_of("app").unwrap()).await?;
            rt.lifecycle().delete(&app).await?;
            return Ok(());
        }
    }

    if let Some(a) = args.subcommand_matches("build") {
        let app_id = a.value_of("app").unwrap();
        let owner = owner_of(a);
        let mut procfile = BTreeMap::new();
        procfile.insert("web".to_string(), "./start".to_string());
        let build = Build {
            image: a.value_of("image").unwrap().to_string(),
            stack: Stack::Container,
            sha: a.value_of("sha").unwrap_or("").to_string(),
            procfile,
            dryccfile: None,
        };
        let release = rt.releases().create_from_build(app_id, owner, build).await?;
        println!("release {} created", release.version);
        return Ok(());
    }

    if let Some(a) = args.subcommand_matches("config") {
        if let Some(c) = a.subcommand_matches("show") {
            let app_id = c.value_of("app").unwrap();
            if let Some(config) = rt.store.latest_config(app_id).await? {
                for (key, value) in config.values {
                    println!("{}={}", key, value.value);
                }
            }
            return Ok(());
        }
        if let Some(c) = a.subcommand_matches("set") {
            let app_id = c.value_of("app").unwrap();
            let mut patch = ConfigPatch::default();
            for pair in c.values_of("pair").unwrap() {
                let (key, value) = split_pair(pair)?;
                patch.values.insert(
                    key.to_string(),
                    Some(paasd_definitions::ConfigValue {
                        value: value.to_string(),
                        group: "global".to_string(),
                    }),
                );
            }
            let prev = rt
                .store
                .latest_config(app_id)
                .await?
                .unwrap_or_else(|| paasd_definitions::Config::new(app_id, owner_of(c)));
            let config = paasd_definitions::Config::merged_from(&prev, patch)?;
            let release = rt.releases().create_from_config(app_id, owner_of(c), config).await?;
            println!("release {} created", release.version);
            return Ok(());
        }
        if let Some(c) = a.subcommand_matches("unset") {
            let app_id = c.value_of("app").unwrap();
            let mut patch = ConfigPatch::default();
            for key in c.values_of("key").unwrap() {
                patch.values.insert(key.to_string(), None);
            }
            let prev = rt
                .store
                .latest_config(app_id)
                .await?
                .ok_or_else(|| paasd_definitions::ErrorKind::NotFound(format!("config for {}", app_id)))?;
            let config = paasd_definitions::Config::merged_from(&prev, patch)?;
            let release = rt.releases().create_from_config(app_id, owner_of(c), config).await?;
            println!("release {} created", release.version);
            return Ok(());
        }
    }

    if let Some(a) = args.subcommand_matches("releases") {
        if let Some(c) = a.subcommand_matches("list") {
            for release in rt.store.list_releases(c.value_of("app").unwrap()).await? {
                println!("v{} ({:?})", release.version, release.state);
            }
            return Ok(());
        }
        if let Some(c) = a.subcommand_matches("rollback") {
            let app_id = c.value_of("app").unwrap();
            let version: u32 = c
                .value_of("version")
                .unwrap()
                .parse()
                .map_err(|_| paasd_definitions::ErrorKind::Validation("version must be a number".into()))?;
            let release = rt.releases().rollback_to(app_id, owner_of(c), version).await?;
            println!("rolled back to v{}", release.version);
            return Ok(());
        }
    }

    if let Some(a) = args.subcommand_matches("deploy") {
        let app = rt.store.get_app(a.value_of("app").unwrap()).await?;
        let mut release = rt
            .releases()
            .latest(&app.id)
            .await?
            .ok_or_else(|| paasd_definitions::ErrorKind::NotFound(format!("release for {}", app.id)))?;
        rt.deploy()
            .deploy(&app, &mut release, None, a.is_present("force"), a.is_present("rolling"))
            .await?;
        println!("deployed v{}", release.version);
        return Ok(());
    }

    if let Some(a) = args.subcommand_matches("ps") {
        if let Some(c) = a.subcommand_matches("scale") {
            let mut app = rt.store.get_app(c.value_of("app").unwrap()).await?;
            for pair in c.values_of("pair").unwrap() {
                let (ptype, count) = split_pair(pair)?;
                let count: u32 = count
                    .parse()
                    .map_err(|_| paasd_definitions::ErrorKind::Validation("count must be a number".into()))?;
                app.structure.insert(ptype.to_string(), count);
            }
            let structure = app.structure.clone();
            rt.deploy().scale(&mut app, structure).await?;
            return Ok(());
        }
        if let Some(c) = a.subcommand_matches("restart") {
            let app = rt.store.get_app(c.value_of("app").unwrap()).await?;
            rt.deploy().restart(&app, c.value_of("ptype").unwrap(), None).await?;
            return Ok(());
        }
    }

    if let Some(a) = args.subcommand_matches("run") {
        let app = rt.store.get_app(a.value_of("app").unwrap()).await?;
        let release = rt
            .releases()
            .latest(&app.id)
            .await?
            .ok_or_else(|| paasd_definitions::ErrorKind::NotFound(format!("release for {}", app.id)))?;
        let cmd: Vec<String> = a.values_of("cmd").unwrap().map(String::from).collect();
        let pod = rt
            .lifecycle()
            .run(&app, &release, a.value_of("ptype").unwrap(), cmd, 600, 3600)
            .await?;
        println!("{}", pod);
        return Ok(());
    }

    if let Some(a) = args.subcommand_matches("resources") {
        if let Some(c) = a.subcommand_matches("bind") {
            rt.resources().bind(c.value_of("app").unwrap(), c.value_of("name").unwrap()).await?;
            return Ok(());
        }
        if let Some(c) = a.subcommand_matches("unbind") {
            rt.resources().unbind(c.value_of("app").unwrap(), c.value_of("name").unwrap()).await?;
            return Ok(());
        }
    }

    Ok(())
}
