//! HTTP provider
//!
//! Two modes:
//! - **single**: the root URL is the only entry, fetched once during `init`
//!   so an unreachable server fails the stage
//! - **crawl**: the root URL is an HTML directory listing; links below the
//!   root are followed breadth-first (directories end in `/`) and every leaf
//!   link becomes an entry that issues a fresh request each time it is opened

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method, Url};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

use super::streaming::{Discover, EntrySender};
use super::{Entry, EntryFilter, EntryOpener, EntryReader, ProviderError};
use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    /// Request method for the root resource, GET by default
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Treat the root as a directory listing and follow its links
    #[serde(default)]
    pub crawl: bool,
    /// Regular expression a leaf link target must match to be kept
    #[serde(default)]
    pub link_regex: Option<String>,
    /// Glob over entry names
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_recursive() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingField {
                context: "http provider".to_string(),
                field: "url",
            });
        }
        Url::parse(&self.url).map_err(|e| ConfigError::Invalid {
            key: "url".to_string(),
            message: e.to_string(),
        })?;
        self.method()?;
        if let Some(pattern) = &self.link_regex {
            Regex::new(pattern).map_err(|e| ConfigError::Pattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        }
        EntryFilter::new(self.pattern.as_deref(), self.recursive)?;
        Ok(())
    }

    fn method(&self) -> Result<Method, ConfigError> {
        match &self.method {
            None => Ok(Method::GET),
            Some(raw) => Method::from_bytes(raw.to_uppercase().as_bytes()).map_err(|_| {
                ConfigError::Invalid {
                    key: "method".to_string(),
                    message: format!("unknown HTTP method `{}`", raw),
                }
            }),
        }
    }

    fn password(&self) -> Result<Option<String>, ConfigError> {
        match (&self.password, &self.password_env) {
            (Some(password), _) => Ok(Some(password.clone())),
            (None, Some(var)) => std::env::var(var)
                .map(Some)
                .map_err(|_| ConfigError::MissingEnv(var.clone())),
            (None, None) => Ok(None),
        }
    }
}

/// Request template shared by the root fetch and every entry opener
#[derive(Clone)]
struct RequestSpec {
    client: Client,
    username: Option<String>,
    password: Option<String>,
}

impl RequestSpec {
    async fn fetch(
        &self,
        method: Method,
        url: &Url,
        body: Option<&str>,
    ) -> Result<Vec<u8>, ProviderError> {
        debug!(url = %url, method = %method, "HTTP request");
        let mut request = self.client.request(method, url.clone());
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// [`Discover`] implementation for `http`
pub struct HttpCrawler {
    root: Url,
    method: Method,
    body: Option<String>,
    crawl: bool,
    link_regex: Option<Regex>,
    timeout: Duration,
    username: Option<String>,
    password: Option<String>,
    spec: Option<RequestSpec>,
    root_body: Option<Vec<u8>>,
}

impl HttpCrawler {
    pub fn from_config(config: &HttpConfig) -> Result<(Self, EntryFilter), ConfigError> {
        config.validate()?;
        let filter = EntryFilter::new(config.pattern.as_deref(), config.recursive)?;
        let root = Url::parse(&config.url).map_err(|e| ConfigError::Invalid {
            key: "url".to_string(),
            message: e.to_string(),
        })?;
        let link_regex = match &config.link_regex {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| ConfigError::Pattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?),
            None => None,
        };

        Ok((
            Self {
                root,
                method: config.method()?,
                body: config.body.clone(),
                crawl: config.crawl,
                link_regex,
                timeout: Duration::from_secs(config.timeout_secs),
                username: config.username.clone(),
                password: config.password()?,
                spec: None,
                root_body: None,
            },
            filter,
        ))
    }

    /// Prefix every followed link must start with
    fn scope(&self) -> String {
        let root = self.root.as_str();
        match root.rfind('/') {
            Some(idx) => root[..=idx].to_string(),
            None => root.to_string(),
        }
    }
}

/// Links of an HTML listing, resolved against `base`, in document order
pub fn listing_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        // sort toggles, anchors and parent links of autoindex pages
        if href.is_empty()
            || href.starts_with('?')
            || href.starts_with('#')
            || href.starts_with("mailto:")
            || href == "../"
        {
            continue;
        }
        if let Ok(mut url) = base.join(href) {
            url.set_fragment(None);
            if seen.insert(url.to_string()) {
                links.push(url);
            }
        }
    }
    links
}

fn url_file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| url.host_str().unwrap_or("index").to_string())
}

#[async_trait]
impl Discover for HttpCrawler {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn endpoint_id(&self) -> String {
        self.root.to_string()
    }

    async fn connect(&mut self) -> Result<(), ProviderError> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent("scanetl/0.1")
            .build()?;
        let spec = RequestSpec {
            client,
            username: self.username.clone(),
            password: self.password.clone(),
        };

        info!(url = %self.root, crawl = self.crawl, "Fetching HTTP root");
        let body = spec
            .fetch(self.method.clone(), &self.root, self.body.as_deref())
            .await?;
        self.root_body = Some(body);
        self.spec = Some(spec);
        Ok(())
    }

    async fn discover(&mut self, out: &EntrySender) -> Result<(), ProviderError> {
        let (Some(spec), Some(root_body)) = (self.spec.clone(), self.root_body.take()) else {
            return Ok(());
        };

        if !self.crawl {
            let entry = Entry::from_bytes(url_file_name(&self.root), self.root.as_str(), root_body);
            out.offer(entry).await;
            return Ok(());
        }

        let scope = self.scope();
        let mut visited = HashSet::from([self.root.to_string()]);
        let mut pages = VecDeque::from([(self.root.clone(), Some(root_body))]);

        while let Some((page, body)) = pages.pop_front() {
            let body = match body {
                Some(body) => body,
                None => match spec.fetch(Method::GET, &page, None).await {
                    Ok(body) => body,
                    Err(e) => {
                        out.skip(page.as_str(), e);
                        continue;
                    },
                },
            };

            let html = String::from_utf8_lossy(&body);
            for link in listing_links(&html, &page) {
                if !link.as_str().starts_with(&scope) || !visited.insert(link.to_string()) {
                    continue;
                }

                if link.path().ends_with('/') {
                    if out.recursive() {
                        pages.push_back((link, None));
                    }
                    continue;
                }

                if let Some(regex) = &self.link_regex {
                    if !regex.is_match(link.as_str()) {
                        continue;
                    }
                }

                let entry = Entry::new(
                    url_file_name(&link),
                    link.as_str(),
                    HttpOpener {
                        spec: spec.clone(),
                        url: link.clone(),
                    },
                );
                if !out.offer(entry).await {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

struct HttpOpener {
    spec: RequestSpec,
    url: Url,
}

#[async_trait]
impl EntryOpener for HttpOpener {
    async fn open(&self) -> Result<EntryReader, ProviderError> {
        let body = self.spec.fetch(Method::GET, &self.url, None).await?;
        Ok(Box::pin(std::io::Cursor::new(body)))
    }
}
