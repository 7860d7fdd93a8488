//! # 响应模块
//!
//! 处理函数通过 [`ResponseWriter`] 写出响应：先设置头部，再宣告状态码，最后写入
//! 响应体。服务端使用的实现是缓冲型的 [`Response`]，处理结束后统一序列化为报文。
//! 错误拦截包装器（`intercept` 模块）同样实现了这一 trait。

use std::io::{self, Write};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::{debug, warn};

use crate::{headers::Headers, param::*, util::http_date};

/// 响应输出端。
///
/// 语义与常见的 HTTP 服务端接口一致：
/// - `write_header` 只有第一次调用生效；
/// - 未宣告状态码时首次 `write` 视为 200。
pub trait ResponseWriter: Send {
    fn headers(&mut self) -> &mut Headers;

    fn write_header(&mut self, status: u16);

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn write_str(&mut self, s: &str) {
        let _ = self.write(s.as_bytes());
    }
}

/// 缓冲型响应，序列化前所有内容都保存在内存中。
#[derive(Debug, Clone, Default)]
pub struct Response {
    status: Option<u16>,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseWriter for Response {
    fn headers(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: u16) {
        match self.status {
            None => self.status = Some(status),
            Some(old) => warn!("重复设置状态码：{} -> {}，忽略", old, status),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.status = Some(200);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用指定状态码与 HTML 内容构造响应
    pub fn from_html(code: u16, html: &str) -> Self {
        let mut response = Self::new();
        response
            .headers
            .set("Content-Type", "text/html; charset=utf-8");
        response.write_header(code);
        response.write_str(html);
        response
    }

    /// 最终状态码，未宣告时为 200
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    pub fn information(&self) -> &'static str {
        reason_phrase(self.status_code())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers_ref(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn body_allowed(&self) -> bool {
        !matches!(self.status_code(), 100..=199 | 204 | 304)
    }

    /// 序列化为 HTTP/1.1 报文。
    ///
    /// `Content-Length` 若已由处理函数设置则保留（HEAD 请求依赖这一点），
    /// 否则按响应体长度补齐；HEAD 请求不输出响应体。
    pub fn as_bytes(&self, head_only: bool) -> Vec<u8> {
        let code = self.status_code();
        let mut header = format!("HTTP/1.1 {} {}{}", code, reason_phrase(code), CRLF);
        for (name, value) in self.headers.iter() {
            // 连接管理由服务端负责
            if name.eq_ignore_ascii_case("Connection") {
                continue;
            }
            header.push_str(&format!("{}: {}{}", name, value, CRLF));
        }
        if self.body_allowed() && !self.headers.contains("Content-Length") {
            header.push_str(&format!("Content-Length: {}{}", self.body.len(), CRLF));
        }
        if !self.headers.contains("Date") {
            header.push_str(&format!("Date: {}{}", http_date(std::time::SystemTime::now()), CRLF));
        }
        if !self.headers.contains("Server") {
            header.push_str(&format!("Server: {}{}", SERVER_NAME, CRLF));
        }
        header.push_str("Connection: close");
        header.push_str(CRLF);
        header.push_str(CRLF);

        let mut bytes = header.into_bytes();
        if !head_only && self.body_allowed() {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

pub(crate) fn compress(data: &[u8], mode: Option<HttpEncoding>) -> io::Result<Vec<u8>> {
    let result = match mode {
        Some(HttpEncoding::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Deflate) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Br) => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
        None => Ok(data.to_vec()),
    };

    if let Ok(ref compressed) = result {
        debug!(
            "压缩完成: {:?}, 原始大小: {} bytes, 压缩后: {} bytes",
            mode,
            data.len(),
            compressed.len()
        );
    }
    result
}

/// 已经是压缩格式的内容不再二次压缩
pub(crate) fn should_skip_compression(mime_type: &str) -> bool {
    const SKIP_TYPES: [&str; 13] = [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/avif",
        "video/",
        "audio/",
        "application/zip",
        "application/x-7z-compressed",
        "application/gzip",
        "font/woff",
        "font/woff2",
        "application/vnd.ms-fontobject",
    ];
    SKIP_TYPES.iter().any(|t| mime_type.starts_with(t))
}

pub(crate) fn decide_encoding(accept_encoding: &[HttpEncoding]) -> Option<HttpEncoding> {
    [HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br]
        .into_iter()
        .find(|e| accept_encoding.contains(e))
}
