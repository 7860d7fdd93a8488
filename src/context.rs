// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求上下文
//!
//! 每个请求对应一个 [`Http`]，只属于处理该请求的线程。会话与查询参数在第一次访问时
//! 才会计算，随后在本次请求内复用。

use std::{sync::Arc, time::Duration};

use log::{debug, error};
use serde::Serialize;

use crate::{
    exception::Exception,
    lifecycle::Abort,
    request::Request,
    response::ResponseWriter,
    server::AppState,
    session::Session,
    template::CachedTemplate,
    util::http_date,
};

/// 请求结束时需要执行的清理动作
pub trait Closer {
    fn close(self: Box<Self>);
}

impl<F: FnOnce()> Closer for F {
    fn close(self: Box<Self>) {
        (*self)()
    }
}

pub struct Http<'a> {
    request: &'a Request,
    writer: &'a mut dyn ResponseWriter,
    state: &'a Arc<AppState>,
    session: Option<Session>,
    closers: Vec<Box<dyn Closer + 'a>>,
    query: Option<Vec<(String, String)>>,
    label: String,
}

impl<'a> Http<'a> {
    pub fn new(
        request: &'a Request,
        writer: &'a mut dyn ResponseWriter,
        state: &'a Arc<AppState>,
    ) -> Self {
        Self {
            request,
            writer,
            state,
            session: None,
            closers: Vec::with_capacity(3),
            query: None,
            label: String::new(),
        }
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn writer(&mut self) -> &mut dyn ResponseWriter {
        &mut *self.writer
    }

    pub fn state(&self) -> &'a Arc<AppState> {
        self.state
    }

    /// 启用并返回会话，首次调用时才会读取 Cookie
    pub fn session(&mut self) -> &mut Session {
        let (request, state) = (self.request, self.state);
        let writer = &mut *self.writer;
        self.session
            .get_or_insert_with(|| state.sessions().start(request, writer))
    }

    /// 注册请求结束时执行的动作，按注册顺序调用
    pub fn close_on_end<C: Closer + 'a>(&mut self, closer: C) {
        self.closers.push(Box::new(closer));
    }

    /// 访问日志末尾的附加标签
    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 记录错误日志并中止当前处理函数，错误会交给统一错误处理函数
    pub fn fatal(&self, msg: &str) -> ! {
        error!("[ID{}]{}", self.request.id(), msg);
        std::panic::panic_any(Abort(msg.to_string()))
    }

    pub(crate) fn take_closers(&mut self) -> Vec<Box<dyn Closer + 'a>> {
        std::mem::take(&mut self.closers)
    }
}

// --- 请求参数 ---

impl<'a> Http<'a> {
    /// 表单请求读取请求体中的参数，其他请求读取 URL 查询串
    fn query(&mut self) -> &[(String, String)] {
        let request = self.request;
        self.query.get_or_insert_with(|| {
            let is_form = request
                .header("Content-Type")
                .is_some_and(|ct| ct.contains("application/x-www-form-urlencoded"));
            let parsed = if is_form {
                serde_urlencoded::from_bytes::<Vec<(String, String)>>(request.body())
            } else {
                serde_urlencoded::from_str::<Vec<(String, String)>>(request.query())
            };
            parsed.unwrap_or_else(|e| {
                debug!("[ID{}]无法解析请求参数: {}", request.id(), e);
                Vec::new()
            })
        })
    }

    /// 参数不存在时返回空字符串
    pub fn get(&mut self, name: &str) -> &str {
        self.query()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn gets(&mut self, name: &str) -> Vec<&str> {
        self.query()
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// 所有参数都存在时返回 true
    pub fn has(&mut self, names: &[&str]) -> bool {
        let query = self.query();
        names.iter().all(|n| query.iter().any(|(k, _)| k == n))
    }

    pub fn get_f(&mut self, name: &str) -> Result<f64, Exception> {
        let value = self.get(name);
        value.trim().parse::<f64>().map_err(|_| Exception::BadParam {
            name: name.to_string(),
            value: value.to_string(),
            kind: "float",
        })
    }

    pub fn get_i(&mut self, name: &str) -> Result<i64, Exception> {
        let value = self.get(name);
        value.trim().parse::<i64>().map_err(|_| Exception::BadParam {
            name: name.to_string(),
            value: value.to_string(),
            kind: "integer",
        })
    }

    /// 无法识别的值视为 false
    pub fn get_b(&mut self, name: &str) -> bool {
        matches!(self.get(name), "1" | "t" | "T" | "true" | "TRUE" | "True")
    }

    /// 从路径中名为 `fix_base` 的片段之后开始，把后续片段依次绑定到 `outs`。
    ///
    /// 返回值为 0 表示数量一致；为正表示丢弃的多余片段数；为负表示未被赋值的输出数量。
    /// 例如 `/api/user/7/edit` 配合 `fix_base = "user"` 与两个输出得到 `7`、`edit`。
    pub fn url_param(&self, fix_base: &str, outs: &mut [&mut String]) -> Result<isize, Exception> {
        if outs.is_empty() {
            return Err(Exception::BindOutParam);
        }
        let segments: Vec<&str> = self.request.path().split('/').collect();
        let start = match segments.iter().position(|s| *s == fix_base) {
            Some(i) if i + 1 < segments.len() => i + 1,
            _ => return Err(Exception::BindNotFix),
        };
        let rest = &segments[start..];
        for (out, seg) in outs.iter_mut().zip(rest.iter()) {
            **out = seg.to_string();
        }
        Ok(rest.len() as isize - outs.len() as isize)
    }

    /// `Accept-Language` 中的首选语言
    pub fn accept_language(&self) -> &'a str {
        let request = self.request;
        request
            .header("Accept-Language")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .unwrap_or("")
    }
}

// --- 输出 ---

impl<'a> Http<'a> {
    pub fn write_str(&mut self, s: &str) {
        self.writer.write_str(s);
    }

    /// 输出错误信息，不影响处理流程
    pub fn write_err(&mut self, e: &dyn std::error::Error) {
        error!("[ID{}]ERR. {}", self.request.id(), e);
        self.writer.write_str(&e.to_string());
    }

    pub fn write_css(&mut self, href: &str) {
        self.writer.write_str(&format!(
            "<link type='text/css' href='{}' rel='stylesheet'/>",
            href
        ));
    }

    /// 输出 HTML 标签，`attrs` 为 (属性名, 属性值) 列表
    pub fn tag<F: FnOnce(&mut Self)>(&mut self, name: &str, attrs: &[(&str, &str)], body: F) {
        let mut open = format!("<{}", name);
        for (k, v) in attrs {
            open.push_str(&format!(" {}=\"{}\"", k, v));
        }
        open.push('>');
        self.write_str(&open);
        body(self);
        self.write_str(&format!("</{}>", name));
    }

    pub fn text_tag(&mut self, name: &str, text: &str, attrs: &[(&str, &str)]) {
        self.tag(name, attrs, |h| h.write_str(text));
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) {
        self.writer
            .headers()
            .set("Content-Type", "application/json; charset=utf-8");
        match serde_json::to_vec(value) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                let _ = self.writer.write(&bytes);
            }
            Err(e) => {
                self.writer.write_header(500);
                self.writer.write_str("server error 500");
                if self.state.debug() {
                    self.writer.write_str(&e.to_string());
                }
                error!("[ID{}]JSON输出失败: {}", self.request.id(), e);
            }
        }
    }

    /// 设置缓存时间，应在输出任何内容之前调用；不大于 0 时禁止缓存
    pub fn cache_time(&mut self, d: Duration) {
        let value = if d.is_zero() {
            "no-store".to_string()
        } else {
            format!("max-age={}", d.as_secs())
        };
        self.writer.headers().set("Cache-Control", &value);
    }

    /// 读取模板目录下的模板，并以模板修改时间设置 `Last-Modified`
    pub fn get_tpl(&mut self, name: &str) -> Result<Arc<CachedTemplate>, Exception> {
        let path = self.state.template_dir().join(name);
        let template = self.state.templates().resolve(&path)?;
        self.writer
            .headers()
            .set("Last-Modified", &http_date(template.last_modified()));
        Ok(template)
    }

    pub fn set_download_filename(&mut self, name: &str) {
        let encoded = urlencoding::encode(name);
        self.writer.headers().add(
            "Content-Disposition",
            &format!(
                "attachment; filename=\"{}\";filename*=utf-8''{}",
                encoded, encoded
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, param::HttpRequestMethod, response::Response};

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::new()).unwrap())
    }

    #[test]
    fn test_query_from_url() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/s?a=1&b=x%20y&a=2&flag=true");
        let mut resp = Response::new();
        let mut h = Http::new(&req, &mut resp, &state);

        assert_eq!(h.get("a"), "1");
        assert_eq!(h.gets("a"), vec!["1", "2"]);
        assert_eq!(h.get("b"), "x y");
        assert_eq!(h.get("missing"), "");
        assert!(h.has(&["a", "b"]));
        assert!(!h.has(&["a", "c"]));
        assert!(h.get_b("flag"));
        assert!(!h.get_b("b"));
        assert_eq!(h.get_i("a").unwrap(), 1);
    }

    #[test]
    fn test_form_body_replaces_url_query() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Post, "/s?a=url")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body("a=form&n=2.5");
        let mut resp = Response::new();
        let mut h = Http::new(&req, &mut resp, &state);

        assert_eq!(h.get("a"), "form");
        assert_eq!(h.get_f("n").unwrap(), 2.5);
    }

    #[test]
    fn test_bad_param_error() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/s?n=abc");
        let mut resp = Response::new();
        let mut h = Http::new(&req, &mut resp, &state);

        let err = h.get_i("n").unwrap_err();
        assert!(matches!(&err, Exception::BadParam { kind: "integer", .. }));
        assert_eq!(err.status_code(), 400);
        assert!(h.get_f("none").is_err());
    }

    #[test]
    fn test_url_param_binding() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/api/user/7/edit/extra");
        let mut resp = Response::new();
        let h = Http::new(&req, &mut resp, &state);

        let (mut id, mut action) = (String::new(), String::new());
        assert_eq!(h.url_param("user", &mut [&mut id, &mut action]).unwrap(), 1);
        assert_eq!((id.as_str(), action.as_str()), ("7", "edit"));

        let (mut a, mut b, mut c, mut d) =
            (String::new(), String::new(), String::new(), String::new());
        assert_eq!(
            h.url_param("edit", &mut [&mut a, &mut b, &mut c, &mut d]).unwrap(),
            -3
        );
        assert_eq!(a, "extra");
        assert!(b.is_empty());

        assert!(matches!(h.url_param("user", &mut []), Err(Exception::BindOutParam)));
        let mut x = String::new();
        assert!(matches!(h.url_param("nope", &mut [&mut x]), Err(Exception::BindNotFix)));
        assert!(matches!(h.url_param("extra", &mut [&mut x]), Err(Exception::BindNotFix)));
    }

    #[test]
    fn test_tags_and_headers() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/")
            .with_header("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8");
        let mut resp = Response::new();
        {
            let mut h = Http::new(&req, &mut resp, &state);
            assert_eq!(h.accept_language(), "zh-CN");
            h.tag("div", &[("class", "box")], |h| h.text_tag("b", "hi", &[]));
            h.write_css("/a.css");
            h.cache_time(Duration::from_secs(60));
            h.set_download_filename("报告 1.txt");
        }
        let body = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(body.starts_with("<div class=\"box\"><b>hi</b></div>"));
        assert!(body.ends_with("<link type='text/css' href='/a.css' rel='stylesheet'/>"));
        assert_eq!(resp.header("Cache-Control"), Some("max-age=60"));
        let disposition = resp.header("Content-Disposition").unwrap();
        assert!(disposition.starts_with("attachment; filename=\""));
        assert!(disposition.contains("filename*=utf-8''%E6%8A%A5%E5%91%8A%201.txt"));
    }

    #[test]
    fn test_cache_time_zero_is_no_store() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/");
        let mut resp = Response::new();
        Http::new(&req, &mut resp, &state).cache_time(Duration::ZERO);
        assert_eq!(resp.header("Cache-Control"), Some("no-store"));
    }

    #[test]
    fn test_json_output() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/");
        let mut resp = Response::new();
        Http::new(&req, &mut resp, &state).json(&serde_json::json!({"ok": true}));
        assert_eq!(resp.body(), b"{\"ok\":true}\n");
        assert_eq!(
            resp.header("Content-Type"),
            Some("application/json; charset=utf-8")
        );
    }

    #[test]
    fn test_session_is_lazy_and_reused() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/");
        let mut resp = Response::new();
        {
            let mut h = Http::new(&req, &mut resp, &state);
            let id = h.session().id().to_string();
            h.session().set("n", &1).unwrap();
            assert_eq!(h.session().id(), id);
        }
        assert_eq!(resp.headers_ref().get_all("Set-Cookie").count(), 1);

        let mut untouched = Response::new();
        Http::new(&req, &mut untouched, &state).write_str("x");
        assert!(untouched.header("Set-Cookie").is_none());
    }

    #[test]
    fn test_write_err_keeps_status() {
        let state = state();
        let req = Request::new(HttpRequestMethod::Get, "/");
        let mut resp = Response::new();
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        Http::new(&req, &mut resp, &state).write_err(&err);
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.body(), b"disk full");
    }
}
