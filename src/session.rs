// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 会话模块
//!
//! - [`SecureCookie`]：会话 ID 的 Cookie 编解码。内容以 AES-128-GCM（16 字节块密钥）
//!   加密，再以 HMAC-SHA256（32 字节签名密钥）对 `名称|时间戳|密文` 签名。
//! - [`SessionStore`]：会话数据的存储契约，内置 [`MemoryStore`]。
//! - [`SessionManager`]：根据请求中的 Cookie 恢复会话，或创建新会话并写出 `Set-Cookie`。
//!
//! 会话只在处理函数第一次访问时才启动。

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes128Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{debug, error, warn};
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use crate::{exception::Exception, request::Request, response::ResponseWriter};

type HmacSha256 = Hmac<Sha256>;

pub const HASH_KEY_LEN: usize = 32;
pub const BLOCK_KEY_LEN: usize = 16;
const NONCE_LEN: usize = 12;

pub type SessionValues = HashMap<String, Value>;

/// 签名并加密的 Cookie 编解码器
#[derive(Clone)]
pub struct SecureCookie {
    hash_key: Vec<u8>,
    cipher: Aes128Gcm,
    max_age: Duration,
}

impl SecureCookie {
    pub fn new(hash_key: &[u8], block_key: &[u8]) -> Result<Self, Exception> {
        if hash_key.len() != HASH_KEY_LEN {
            return Err(Exception::Cookie(format!(
                "hash key must be {} bytes",
                HASH_KEY_LEN
            )));
        }
        let cipher = Aes128Gcm::new_from_slice(block_key)
            .map_err(|_| Exception::Cookie(format!("block key must be {} bytes", BLOCK_KEY_LEN)))?;
        Ok(Self {
            hash_key: hash_key.to_vec(),
            cipher,
            max_age: Duration::from_secs(86400 * 30),
        })
    }

    /// 生成随机密钥
    pub fn generate_key(len: usize) -> Vec<u8> {
        let mut key = vec![0u8; len];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// 超过该时长的 Cookie 在解码时被拒绝
    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    pub fn encode(&self, name: &str, value: &str) -> Result<String, Exception> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, value.as_bytes())
            .map_err(|e| Exception::Cookie(format!("encrypt failed: {}", e)))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        let payload = URL_SAFE_NO_PAD.encode(sealed);
        let timestamp = Utc::now().timestamp();

        let tag = self.sign(name, timestamp, &payload)?.finalize().into_bytes();
        Ok(format!(
            "{}|{}|{}",
            timestamp,
            payload,
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    pub fn decode(&self, name: &str, cookie: &str) -> Result<String, Exception> {
        let mut parts = cookie.splitn(3, '|');
        let (Some(ts), Some(payload), Some(tag)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Exception::Cookie("malformed value".into()));
        };
        let timestamp: i64 = ts
            .parse()
            .map_err(|_| Exception::Cookie("invalid timestamp".into()))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| Exception::Cookie("invalid signature encoding".into()))?;
        self.sign(name, timestamp, payload)?
            .verify_slice(&tag)
            .map_err(|_| Exception::Cookie("signature mismatch".into()))?;

        let age = Utc::now().timestamp() - timestamp;
        if age < -60 || age > self.max_age.as_secs() as i64 {
            return Err(Exception::Cookie("expired".into()));
        }

        let sealed = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Exception::Cookie("invalid payload encoding".into()))?;
        if sealed.len() <= NONCE_LEN {
            return Err(Exception::Cookie("payload too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Exception::Cookie("decrypt failed".into()))?;
        String::from_utf8(plain).map_err(|_| Exception::Cookie("value is not utf-8".into()))
    }

    fn sign(&self, name: &str, timestamp: i64, payload: &str) -> Result<HmacSha256, Exception> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hash_key)
            .map_err(|e| Exception::Cookie(e.to_string()))?;
        mac.update(format!("{}|{}|{}", name, timestamp, payload).as_bytes());
        Ok(mac)
    }
}

/// 会话数据的存储契约
#[cfg_attr(test, mockall::automock)]
pub trait SessionStore: Send + Sync {
    /// 返回未过期的会话数据
    fn load(&self, sid: &str) -> Option<SessionValues>;

    fn save(&self, sid: &str, values: &SessionValues, lifetime: Duration);

    fn destroy(&self, sid: &str);
}

/// 每写入这么多次会话就清扫一次过期条目
const SWEEP_INTERVAL: usize = 64;

/// 进程内会话存储，条目在有效期后失效。过期条目在读取时或周期性的写入清扫中移除。
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Instant, SessionValues)>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清除过期条目后的会话数量
    pub fn len(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();
        entries.retain(|_, (expires, _)| *expires > now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Instant, SessionValues)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("会话存储锁被污染，恢复并继续");
                poisoned.into_inner()
            }
        }
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, sid: &str) -> Option<SessionValues> {
        let mut entries = self.lock();
        match entries.get(sid) {
            Some((expires, values)) if *expires > Instant::now() => Some(values.clone()),
            Some(_) => {
                entries.remove(sid);
                None
            }
            None => None,
        }
    }

    fn save(&self, sid: &str, values: &SessionValues, lifetime: Duration) {
        let now = Instant::now();
        let mut entries = self.lock();
        if (self.saves.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            let before = entries.len();
            entries.retain(|_, (expires, _)| *expires > now);
            debug!("清扫过期会话{}个", before - entries.len());
        }
        entries.insert(sid.to_string(), (now + lifetime, values.clone()));
    }

    fn destroy(&self, sid: &str) {
        self.lock().remove(sid);
    }
}

/// 一个客户端的会话。写操作会立即同步到存储。
pub struct Session {
    id: String,
    values: SessionValues,
    store: Arc<dyn SessionStore>,
    lifetime: Duration,
    is_new: bool,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 本次请求中新建的会话
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), Exception> {
        self.values
            .insert(key.to_string(), serde_json::to_value(value)?);
        self.sync();
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        let old = self.values.remove(key);
        if old.is_some() {
            self.sync();
        }
        old
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.sync();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 从存储中删除该会话，之后的请求会得到新的会话
    pub fn destroy(self) {
        self.store.destroy(&self.id);
    }

    fn sync(&self) {
        self.store.save(&self.id, &self.values, self.lifetime);
    }
}

pub struct SessionManager {
    codec: SecureCookie,
    cookie_name: String,
    lifetime: Duration,
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(
        mut codec: SecureCookie,
        cookie_name: &str,
        lifetime: Duration,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        codec.set_max_age(lifetime);
        Self {
            codec,
            cookie_name: cookie_name.to_string(),
            lifetime,
            store,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// 恢复请求携带的会话；Cookie 缺失、无效或会话已过期时创建新会话。
    pub fn start(&self, request: &Request, w: &mut dyn ResponseWriter) -> Session {
        if let Some(raw) = request.cookie(&self.cookie_name) {
            match self.codec.decode(&self.cookie_name, raw) {
                Ok(sid) => match self.store.load(&sid) {
                    Some(values) => {
                        return Session {
                            id: sid,
                            values,
                            store: Arc::clone(&self.store),
                            lifetime: self.lifetime,
                            is_new: false,
                        }
                    }
                    None => debug!("[ID{}]会话{}已过期", request.id(), sid),
                },
                Err(e) => debug!("[ID{}]忽略无效的会话Cookie: {}", request.id(), e),
            }
        }

        let sid = uuid::Uuid::new_v4().simple().to_string();
        let values = SessionValues::new();
        self.store.save(&sid, &values, self.lifetime);
        match self.codec.encode(&self.cookie_name, &sid) {
            Ok(value) => w.headers().add(
                "Set-Cookie",
                format!(
                    "{}={}; Path=/; Max-Age={}; HttpOnly",
                    self.cookie_name,
                    value,
                    self.lifetime.as_secs()
                ),
            ),
            Err(e) => error!("[ID{}]无法编码会话Cookie: {}", request.id(), e),
        }
        Session {
            id: sid,
            values,
            store: Arc::clone(&self.store),
            lifetime: self.lifetime,
            is_new: true,
        }
    }
}
