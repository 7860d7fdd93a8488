// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 演示服务器
//!
//! 展示工具箱的各类路由：普通服务、模板页面、静态资源和跳转，
//! 并提供后台管理控制台（`stop` / `status` / `help`）。

use std::{collections::HashMap, process, sync::Arc, time::Duration};

use log::{error, info, warn};
use serde_derive::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
};

use trowel::{Config, Exception, Http, Server, ServerHandle, StaticResource};

const CONFIG_FILE: &str = "config/development.toml";
const LOG_CONFIG_FILE: &str = "config/log4rs.yaml";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct IndexPage {
    title: String,
    visits: i64,
    language: String,
}

fn main() {
    if let Err(e) = log4rs::init_file(LOG_CONFIG_FILE, Default::default()) {
        eprintln!("无法初始化日志系统: {}", e);
        process::exit(1);
    }

    let config = match Config::from_toml(CONFIG_FILE) {
        Ok(config) => config,
        Err(e) => {
            warn!("无法载入{}：{}，使用默认配置", CONFIG_FILE, e);
            Config::new().with_defaults()
        }
    };
    info!("配置文件已载入");

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建异步运行时: {}", e);
            process::exit(1);
        }
    };

    let server = match build_server(config) {
        Ok(server) => server,
        Err(e) => {
            error!("初始化服务器失败: {}", e);
            process::exit(1);
        }
    };

    let console = runtime.spawn(console(server.shutdown_handle()));
    if let Err(e) = runtime.block_on(server.start_http_server()) {
        error!("服务器异常退出: {}", e);
        process::exit(1);
    }
    // 等待控制台完成优雅停机
    let _ = runtime.block_on(console);
    info!("服务器已停止");
}

fn build_server(config: Config) -> Result<Server, Exception> {
    let mut server = Server::new(config)?;

    server.set_tpl_func("upper", |args: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
        let text = args
            .get("text")
            .and_then(tera::Value::as_str)
            .unwrap_or_default();
        Ok(tera::Value::String(text.to_uppercase()))
    });

    let index = server.template_page("demo/templates/index.html", |http: &mut Http| {
        let session = http.session();
        let visits = session.get("visits").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
        session.set("visits", &visits)?;
        Ok(IndexPage {
            title: "trowel".into(),
            visits,
            language: http.accept_language().to_string(),
        })
    });
    server.service("/index", index);

    server.service("/api/add", |http: &mut Http| {
        let sum = http.get_f("a")? + http.get_f("b")?;
        http.json(&serde_json::json!({ "sum": sum }));
        Ok(())
    });

    server.service("/download/", |http: &mut Http| {
        let mut name = String::new();
        http.url_param("download", &mut [&mut name])?;
        http.set_download_filename(&name);
        http.set_label(&name);
        http.write_str(&format!("content of {}\n", name));
        Ok(())
    });

    let bundled = match StaticResource::bundle_dir("demo/static") {
        Ok(resource) => {
            info!("已打包{}个静态资源", resource.len());
            Some(Arc::new(resource))
        }
        Err(e) => {
            warn!("无法打包静态资源，只使用本地文件: {}", e);
            None
        }
    };
    server.static_page("/static/", "demo/static", bundled);
    let www_root = server.config().www_root().to_string();
    server.static_page("/files/", www_root, None);

    server.jump_mapping("/", "/index");
    Ok(server)
}

/// 后台管理控制台，读取标准输入中的指令
async fn console(handle: ServerHandle) {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        match reader.read_line(&mut input).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        match input.trim() {
            "stop" => {
                println!("停机指令已激活，等待进行中的请求结束...");
                if let Err(e) = handle.shutdown(SHUTDOWN_TIMEOUT).await {
                    warn!("{}，强制关闭", e);
                    handle.close();
                }
                break;
            }
            "help" => {
                println!("== trowel Help ==");
                println!("stop   - 停止服务");
                println!("status - 查看当前服务器运行状态");
                println!("help   - 显示此帮助信息");
                println!("=================");
            }
            "status" => {
                println!("== trowel 状态 ==");
                println!("当前活跃连接数: {}", handle.active_connections());
                println!("正在停机: {}", handle.is_stopping());
                println!("=================");
            }
            "" => {}
            cmd => println!("无效的命令：{}", cmd),
        }
    }
}
