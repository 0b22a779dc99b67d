use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use consulta_placas::orchestrator::{Records, ServiceStatus};
use consulta_placas::utils::logging;
use consulta_placas::{App, Config, PipelineOutcome, SearchMode, Source};

/// 查询方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Modo {
    Licencia,
    Documento,
}

impl From<Modo> for SearchMode {
    fn from(modo: Modo) -> Self {
        match modo {
            Modo::Licencia => SearchMode::Licencia,
            Modo::Documento => SearchMode::Documento,
        }
    }
}

/// SUNARP / SCPPP 查询工具
#[derive(Parser)]
#[command(name = "consulta_placas", version, about = "Consulta vehicular SUNARP y papeletas SCPPP")]
struct Cli {
    /// 显示详细日志
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 查询车辆（SUNARP）
    Vehiculo { placa: String },
    /// 查询驾驶员（SCPPP）
    Conductor {
        valor: String,
        #[arg(value_enum, default_value = "licencia")]
        modo: Modo,
    },
    /// 软删除车辆记录
    EliminarVehiculo { placa: String },
    /// 软删除驾驶员记录
    EliminarConductor { valor: String },
    /// 分页列出记录
    Listar {
        /// vehiculos | conductores
        fuente: Source,
        #[arg(default_value_t = 1)]
        pagina: u32,
        #[arg(long, default_value_t = 20)]
        por_pagina: u32,
    },
    /// 统计
    Estadisticas {
        /// vehiculos | conductores
        fuente: Source,
    },
    /// 服务状态
    Estado,
    /// 从 TOML 文件批量查询
    Lote { archivo: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let config = Config::from_env()?;
    logging::init(cli.verbose || config.verbose_logging);

    // 只有查询需要初始化整个应用（日志文件、浏览器、识别器）
    match cli.command {
        Commands::Vehiculo { placa } => {
            let app = App::initialize(config).await?;
            report_outcome(app.run_vehicle_query(&placa).await)?
        }
        Commands::Conductor { valor, modo } => {
            let app = App::initialize(config).await?;
            report_outcome(app.run_driver_query(&valor, modo.into()).await)?
        }
        Commands::EliminarVehiculo { placa } => {
            print_json(&Records::open(&config)?.delete_vehicle(&placa)?)?
        }
        Commands::EliminarConductor { valor } => {
            print_json(&Records::open(&config)?.delete_driver(&valor)?)?
        }
        Commands::Listar {
            fuente,
            pagina,
            por_pagina,
        } => print_json(&Records::open(&config)?.list(fuente, pagina, por_pagina)?)?,
        Commands::Estadisticas { fuente } => print_json(&Records::open(&config)?.stats(fuente)?)?,
        Commands::Estado => {
            let status = ServiceStatus::check(&config);
            print_json(&status)?;
            if !status.store_reachable {
                process::exit(1);
            }
        }
        Commands::Lote { archivo } => {
            let app = App::initialize(config).await?;
            let summary = app.run_batch_file(&archivo).await?;
            print_json(&summary)?;
            if summary.failed > 0 {
                process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 成功输出结果，失败输出阶段和原因并以非零状态退出
fn report_outcome(outcome: PipelineOutcome) -> Result<()> {
    match outcome {
        Ok(success) => print_json(&success),
        Err(failure) => {
            print_json(&failure.report())?;
            process::exit(1);
        }
    }
}
