// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # trowel
//!
//! 轻量的 Web 应用工具箱：前缀路由、会话、带缓存的 HTML 模板、静态资源服务，
//! 以及负责错误恢复与延迟清理的请求生命周期包装。

pub mod cache;
pub mod config;
pub mod context;
pub mod exception;
pub mod headers;
pub mod intercept;
pub mod lifecycle;
pub mod param;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod static_files;
pub mod template;
pub mod util;

pub use cache::FileCache;
pub use config::Config;
pub use context::{Closer, Http};
pub use exception::{Exception, HttpError};
pub use headers::Headers;
pub use intercept::{ErrorInterceptor, WrapErrorHandler};
pub use lifecycle::{default_error_handle, Service};
pub use param::{HttpEncoding, HttpRequestMethod, HttpVersion};
pub use request::Request;
pub use response::{Response, ResponseWriter};
pub use router::{Handler, Router};
pub use server::{AppState, ErrorHandler, Listening, Server, ServerHandle};
pub use session::{MemoryStore, SecureCookie, Session, SessionManager, SessionStore};
pub use static_files::{FileServer, StaticPage, StaticResource, StripPrefix};
pub use template::{CachedTemplate, TemplateCache, TemplateFunctions};
pub use util::HtmlBuilder;
