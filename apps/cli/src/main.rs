use std::{io::Read, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use complyai_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：凭据管理、文本生成与响应解析。
 */
#[derive(Parser, Debug)]
#[command(name = "complyai", version, about = "ComplyAI provider orchestration")]
struct Cli {
    /** \brief TOML 配置文件，默认读取当前目录下的 complyai.toml */
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 凭据管理。
     */
    #[command(subcommand)]
    Keys(KeysCommand),

    /**
     * \brief 按回退链生成一段文本。
     */
    Generate(GenerateArgs),

    /**
     * \brief 从文件或标准输入读取模型原文并尝试恢复 JSON。
     */
    Parse {
        #[arg(long)]
        file: Option<PathBuf>,
        /** \brief 结构化解析失败时按字段抓取，逗号分隔 */
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /** \brief 列出凭据（密钥已脱敏） */
    List,
    Add {
        #[arg(long)]
        provider: ProviderKind,
        #[arg(long)]
        secret: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        limit: Option<u64>,
    },
    Update {
        id: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        active: Option<bool>,
        #[arg(long)]
        usage_count: Option<u64>,
        #[arg(long, conflicts_with = "clear_limit")]
        limit: Option<u64>,
        #[arg(long, default_value_t = false)]
        clear_limit: bool,
    },
    Delete {
        id: String,
    },
    /** \brief 探测某个服务当前会选中的凭据，不消耗用量 */
    Test {
        #[arg(long)]
        provider: ProviderKind,
    },
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    system: Option<String>,
    /** \brief 首选服务：openai / anthropic / gemini */
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    tag: Option<String>,
    /** \brief 将回复按 JSON 对象解析后输出 */
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, value_delimiter = ',', requires = "json")]
    fields: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("load config failed")?;
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    telemetry::init(level, config.log_file.as_deref()).context("init logging failed")?;

    match cli.command {
        Commands::Parse { file, fields } => {
            let raw = read_input(file)?;
            print_recovered(&raw, &fields)?;
        }
        command => {
            let service = AiService::start(config, ProviderSecrets::from_env())
                .await
                .context("start ai service failed")?;
            let outcome = run(&service, command).await;
            service.shutdown();
            outcome?;
        }
    }
    Ok(())
}

async fn run(service: &AiService, command: Commands) -> Result<()> {
    match command {
        Commands::Keys(keys) => run_keys(service, keys).await,
        Commands::Generate(args) => run_generate(service, args).await,
        Commands::Parse { .. } => Ok(()),
    }
}

async fn run_keys(service: &AiService, command: KeysCommand) -> Result<()> {
    match command {
        KeysCommand::List => {
            let rows = service.list_credentials().await.context("list credentials failed")?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        KeysCommand::Add {
            provider,
            secret,
            description,
            limit,
        } => {
            let created = service
                .add_credential(NewCredential {
                    provider,
                    secret,
                    description,
                    usage_limit: limit,
                })
                .await
                .context("add credential failed")?;
            println!(
                "Saved credential id={} ({} | {})",
                created.id, created.provider, created.masked_secret
            );
        }
        KeysCommand::Update {
            id,
            secret,
            description,
            active,
            usage_count,
            limit,
            clear_limit,
        } => {
            let usage_limit = if clear_limit { Some(None) } else { limit.map(Some) };
            let updated = service
                .update_credential(
                    &id,
                    CredentialPatch {
                        secret,
                        description,
                        active,
                        usage_count,
                        usage_limit,
                    },
                )
                .await
                .with_context(|| format!("update credential {} failed", id))?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
        KeysCommand::Delete { id } => {
            service
                .delete_credential(&id)
                .await
                .with_context(|| format!("delete credential {} failed", id))?;
            println!("Deleted credential id={}", id);
        }
        KeysCommand::Test { provider } => {
            let status = service
                .test_provider(provider)
                .await
                .with_context(|| format!("probe {} failed", provider))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

async fn run_generate(service: &AiService, args: GenerateArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling generation");
            on_signal.cancel();
        }
    });

    let input = GenerateTextInput {
        prompt: args.prompt,
        system: args.system,
        preferred_provider: args.provider,
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        context_tag: args.tag.or_else(|| Some("cli".to_string())),
    };
    let response = match service.generate_text(input, &cancel).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{}", e.user_message());
            if let Some(raw) = e.raw_text() {
                eprintln!("--- raw response ---\n{}", raw);
            }
            return Err(e).context("generation failed");
        }
    };
    info!(
        provider = %response.provider,
        model = %response.model,
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        estimated = response.usage.estimated,
        "generation finished"
    );

    if args.json {
        print_recovered(&response.text, &args.fields)?;
    } else {
        println!("{}", response.text);
    }
    eprintln!(
        "[{} | {} | tokens {}{}]",
        response.provider,
        response.model,
        response.usage.total_tokens,
        if response.usage.estimated { " (estimated)" } else { "" }
    );
    Ok(())
}

fn print_recovered(raw: &str, fields: &[String]) -> Result<()> {
    let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
    match recover(raw, &fields).context("response could not be parsed")? {
        Recovered::Parsed(map) => {
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
        Recovered::Scraped(scraped) => {
            eprintln!("warning: structured parse failed, showing scraped fields");
            println!("{}", serde_json::to_string_pretty(&scraped)?);
        }
    }
    Ok(())
}

fn read_input(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("read {} failed", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin failed")?;
            Ok(buf)
        }
    }
}
