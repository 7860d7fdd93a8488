use std::{fs, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine};
use log::warn;
use serde_derive::{Deserialize, Serialize};

use crate::exception::Exception;

/// 服务器配置，通常从 TOML 文件载入。
///
/// 未出现在文件中的字段使用 `default_*` 函数给出的默认值。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// 静态文件服务的默认根目录
    #[serde(default = "default_www_root")]
    www_root: String,
    #[serde(default = "default_http_port")]
    http_port: u16,
    /// 为 true 时只监听 127.0.0.1
    #[serde(default)]
    local: bool,
    /// 0 表示按 CPU 核数自动设置
    #[serde(default)]
    worker_threads: usize,
    #[serde(default)]
    debug: bool,
    /// 会话有效期（秒），0 表示使用默认的两小时
    #[serde(default)]
    session_exp_secs: u64,
    #[serde(default = "default_cookie_name")]
    cookie_name: String,
    /// base64 编码的 32 字节签名密钥，缺省时启动时随机生成
    #[serde(default)]
    session_hash_key: Option<String>,
    /// base64 编码的 16 字节加密密钥，缺省时启动时随机生成
    #[serde(default)]
    session_block_key: Option<String>,
    /// 静态资源与模板页面的 `max-age`
    #[serde(default)]
    static_cache_seconds: u32,
    #[serde(default = "default_template_dir")]
    template_dir: String,
    /// 文件系统回退路径的内容缓存条目数
    #[serde(default = "default_file_cache_size")]
    file_cache_size: usize,
    /// 超过该大小的文件不进入内容缓存
    #[serde(default = "default_cache_threshold")]
    cache_threshold: u64,
    #[serde(default = "default_enable_range_requests")]
    enable_range_requests: bool,
    /// 请求头与请求体合计的上限
    #[serde(default = "default_max_request_size")]
    max_request_size: usize,
}

fn default_www_root() -> String {
    ".".to_string()
}

fn default_http_port() -> u16 {
    7077
}

fn default_cookie_name() -> String {
    "trowel_session".to_string()
}

fn default_template_dir() -> String {
    ".".to_string()
}

fn default_file_cache_size() -> usize {
    32
}

fn default_cache_threshold() -> u64 {
    4 * 1024 * 1024 // 4MB
}

fn default_enable_range_requests() -> bool {
    true
}

fn default_max_request_size() -> usize {
    1024 * 1024 // 1MB
}

const DEFAULT_SESSION_EXP_SECS: u64 = 2 * 60 * 60;

impl Default for Config {
    fn default() -> Self {
        Self {
            www_root: default_www_root(),
            http_port: default_http_port(),
            local: false,
            worker_threads: 0,
            debug: false,
            session_exp_secs: 0,
            cookie_name: default_cookie_name(),
            session_hash_key: None,
            session_block_key: None,
            static_cache_seconds: 0,
            template_dir: default_template_dir(),
            file_cache_size: default_file_cache_size(),
            cache_threshold: default_cache_threshold(),
            enable_range_requests: default_enable_range_requests(),
            max_request_size: default_max_request_size(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let text = fs::read_to_string(filename)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, Exception> {
        let config: Config = toml::from_str(text)
            .map_err(|e| Exception::Config(format!("无法解析配置文件: {}", e)))?;
        Ok(config.with_defaults())
    }

    /// 把“0 表示自动”的字段替换为实际值。
    pub fn with_defaults(mut self) -> Self {
        if self.worker_threads == 0 {
            self.worker_threads = num_cpus::get();
        }
        if self.session_exp_secs == 0 {
            self.session_exp_secs = DEFAULT_SESSION_EXP_SECS;
        }
        if self.file_cache_size == 0 {
            warn!("file_cache_size被设置为0，将被改为1。");
            self.file_cache_size = 1;
        }
        self
    }

    /// 解码会话密钥；缺省的一项返回 `None`，由调用方随机生成
    pub fn session_keys(&self) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), Exception> {
        let decode = |name: &str,
                      value: &Option<String>,
                      len: usize|
         -> Result<Option<Vec<u8>>, Exception> {
            let Some(v) = value else {
                return Ok(None);
            };
            let bytes = STANDARD
                .decode(v.trim())
                .map_err(|e| Exception::Config(format!("{} 不是合法的base64: {}", name, e)))?;
            if bytes.len() != len {
                return Err(Exception::Config(format!(
                    "{} 必须是{}字节，实际为{}字节",
                    name,
                    len,
                    bytes.len()
                )));
            }
            Ok(Some(bytes))
        };
        Ok((
            decode("session_hash_key", &self.session_hash_key, 32)?,
            decode("session_block_key", &self.session_block_key, 16)?,
        ))
    }
}

// 构建器风格的设置方法，便于在代码中直接构造配置
impl Config {
    pub fn set_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn set_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn set_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn set_session_exp(mut self, exp: Duration) -> Self {
        self.session_exp_secs = exp.as_secs();
        self
    }

    pub fn set_cookie_name(mut self, name: &str) -> Self {
        self.cookie_name = name.to_string();
        self
    }

    pub fn set_static_cache_seconds(mut self, secs: u32) -> Self {
        self.static_cache_seconds = secs;
        self
    }

    pub fn set_template_dir(mut self, dir: &str) -> Self {
        self.template_dir = dir.to_string();
        self
    }
}

impl Config {
    pub fn www_root(&self) -> &str {
        &self.www_root
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn session_exp(&self) -> Duration {
        Duration::from_secs(self.session_exp_secs)
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn static_cache_seconds(&self) -> u32 {
        self.static_cache_seconds
    }

    pub fn template_dir(&self) -> &str {
        &self.template_dir
    }

    pub fn file_cache_size(&self) -> usize {
        self.file_cache_size
    }

    pub fn cache_threshold(&self) -> u64 {
        self.cache_threshold
    }

    pub fn enable_range_requests(&self) -> bool {
        self.enable_range_requests
    }

    pub fn max_request_size(&self) -> usize {
        self.max_request_size
    }
}
