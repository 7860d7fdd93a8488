// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 负责将 TCP 流中读取的原始字节解析为强类型的 `Request` 结构体：
//! 1. 请求行（方法、目标、版本）的解析，目标拆分为解码后的路径与查询串。
//! 2. 全部标头按原顺序保存，并提供常用标头的访问器。
//! 3. 范围请求（Range）、内容协商（Accept-Encoding）与 Cookie 的解析。

use bytes::Bytes;
use log::error;

use crate::{exception::Exception, headers::Headers, param::*};

/// 请求头结束标记
const HEAD_END: &[u8] = b"\r\n\r\n";

/// 表示一个完整的 HTTP 请求。
#[derive(Debug, Clone)]
pub struct Request {
    id: u128,
    method: HttpRequestMethod,
    /// 请求行中的原始目标（包含查询字符串）
    target: String,
    /// 百分号解码后的路径部分
    path: String,
    query: String,
    version: HttpVersion,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// 从原始字节缓冲区尝试构建 `Request` 实例。
    ///
    /// 缓冲区必须包含完整的请求头；请求头之后的字节全部视为请求体。
    ///
    /// # 参数
    /// * `buffer` - 从网络 Socket 读取的原始数据。
    /// * `id` - 连接 ID，用于在多线程环境下追踪日志。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let head_len = match Self::head_len(buffer) {
            Some(n) => n,
            None => {
                error!("[ID{}]HTTP请求头不完整", id);
                return Err(Exception::MalformedRequest("incomplete request head".into()));
            }
        };
        // 请求头必须是合法的 UTF-8，请求体则按原样保存
        let head = match std::str::from_utf8(&buffer[..head_len - HEAD_END.len()]) {
            Ok(s) => s,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut lines = head.split(CRLF);
        let request_line = lines.next().unwrap_or_default();
        let parts: Vec<&str> = request_line.split(' ').filter(|s| !s.is_empty()).collect();
        if parts.len() < 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::MalformedRequest(request_line.to_string()));
        }

        let method = match parts[0].to_uppercase().as_str() {
            "GET" => HttpRequestMethod::Get,
            "HEAD" => HttpRequestMethod::Head,
            "OPTIONS" => HttpRequestMethod::Options,
            "POST" => HttpRequestMethod::Post,
            "PUT" => HttpRequestMethod::Put,
            "PATCH" => HttpRequestMethod::Patch,
            "DELETE" => HttpRequestMethod::Delete,
            other => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, other);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version = match parts[parts.len() - 1].to_uppercase().as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            other => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, other);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        // 路径中可能夹带空格（虽然不规范），通过 join 尝试恢复
        let target = parts[1..parts.len() - 1].join(" ");
        let (raw_path, query) = match target.split_once('?') {
            Some((p, q)) => (p, q.to_string()),
            None => (target.as_str(), String::new()),
        };
        let path = match urlencoding::decode(raw_path) {
            Ok(p) => p.into_owned(),
            Err(_) => {
                error!("[ID{}]请求路径无法解码：{}", id, raw_path);
                return Err(Exception::InvalidPath);
            }
        };
        if !path.starts_with('/') && path != "*" {
            return Err(Exception::InvalidPath);
        }

        let mut headers = Headers::new();
        for line in lines {
            match line.split_once(':') {
                Some((name, value)) => headers.add(name.trim(), value.trim()),
                None => {
                    error!("[ID{}]无法解析的请求头：{}", id, line);
                    return Err(Exception::MalformedRequest(line.to_string()));
                }
            }
        }

        Ok(Self {
            id,
            method,
            path,
            query,
            target,
            version,
            headers,
            body: Bytes::copy_from_slice(&buffer[head_len..]),
        })
    }

    /// 构造一个不经过网络解析的请求，供内部合成与测试使用。
    pub fn new(method: HttpRequestMethod, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (target.to_string(), String::new()),
        };
        Self {
            id: 0,
            method,
            target: target.to_string(),
            path,
            query,
            version: HttpVersion::V1_1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 若缓冲区中已经包含完整的请求头，返回请求头（含结束标记）的字节长度。
    pub fn head_len(buffer: &[u8]) -> Option<usize> {
        buffer
            .windows(HEAD_END.len())
            .position(|w| w == HEAD_END)
            .map(|p| p + HEAD_END.len())
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// 替换路径，`StripPrefix` 使用
    pub(crate) fn with_path(&self, path: String) -> Self {
        let mut r = self.clone();
        r.path = path;
        r
    }
}

// --- Getter 访问器实现 ---

impl Request {
    pub fn id(&self) -> u128 {
        self.id
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// 解码后的请求路径（不含查询参数）
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 原始请求目标（含查询参数）
    pub fn target(&self) -> &str {
        &self.target
    }

    /// 查询字符串（不含 `?`）
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn user_agent(&self) -> &str {
        self.header("User-Agent").unwrap_or("")
    }

    pub fn accept(&self) -> Option<&str> {
        self.header("Accept")
    }

    /// `Content-Length` 标头，缺失或非法时视为 0
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// 客户端支持的压缩编码列表（按 gzip、deflate、br 的顺序）
    pub fn accept_encoding(&self) -> Vec<HttpEncoding> {
        let mut encodings = vec![];
        if let Some(value) = self.header("Accept-Encoding") {
            if value.contains("gzip") {
                encodings.push(HttpEncoding::Gzip);
            }
            if value.contains("deflate") {
                encodings.push(HttpEncoding::Deflate);
            }
            if value.contains("br") {
                encodings.push(HttpEncoding::Br);
            }
        }
        encodings
    }

    /// 范围请求参数：(起始字节, 结束字节)，结束字节为 `None` 表示直到文件末尾。
    ///
    /// 只支持单一区间，例如 `Range: bytes=0-1023`。
    pub fn range(&self) -> Option<(u64, Option<u64>)> {
        let bytes_part = self.header("Range")?.strip_prefix("bytes=")?;
        let (start, end) = bytes_part.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse::<u64>().ok()?),
        };
        Some((start, end))
    }

    /// 读取指定名称的 Cookie 值
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all("Cookie")
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }
}
