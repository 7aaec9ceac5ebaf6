//! ZAPI wire session
//!
//! XML request/response envelopes for the legacy management API. A request is
//! a single element wrapped in `<netapp>`; the reply carries a `<results>`
//! element whose `status`, `errno` and `reason` attributes report failure.

use crate::config::ArrayCredentials;
use crate::error::{Error, Result};
use async_trait::async_trait;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::time::Duration;
use tracing::debug;

/// Servlet path accepting ZAPI envelopes
pub const ZAPI_SERVLET: &str = "/servlets/netapp.servlets.admin.XMLrequest_filer";

const ZAPI_NAMESPACE: &str = "http://www.netapp.com/filer/admin";

// =============================================================================
// Element Tree
// =============================================================================

/// One XML element of a ZAPI request or reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZapiElement {
    pub name: String,
    pub text: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<ZapiElement>,
}

impl ZapiElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append a nested element
    pub fn with(mut self, child: ZapiElement) -> Self {
        self.children.push(child);
        self
    }

    /// Append a leaf element holding `value`
    pub fn field(self, name: impl Into<String>, value: impl ToString) -> Self {
        let mut leaf = ZapiElement::new(name);
        leaf.text = value.to_string();
        self.with(leaf)
    }

    pub fn child(&self, name: &str) -> Option<&ZapiElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text of a direct child
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Element reached by following `path` from here
    pub fn descend(&self, path: &[&str]) -> Option<&ZapiElement> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ZapiElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

// =============================================================================
// Envelope Encoding
// =============================================================================

fn xml_error(e: impl std::fmt::Display) -> Error {
    Error::Xml(e.to_string())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &ZapiElement) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    writer
        .write_event(Event::Start(start))
        .map_err(xml_error)?;
    if !element.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&element.text)))
            .map_err(xml_error)?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(xml_error)?;
    Ok(())
}

/// Wrap `request` in a `<netapp>` envelope, scoped to `vserver` when given
pub fn encode_request(version: &str, vserver: Option<&str>, request: &ZapiElement) -> Result<String> {
    let mut envelope = ZapiElement::new("netapp").with(request.clone());
    envelope.attributes.push(("version".into(), version.into()));
    envelope.attributes.push(("xmlns".into(), ZAPI_NAMESPACE.into()));
    if let Some(vserver) = vserver {
        envelope.attributes.push(("vfiler".into(), vserver.into()));
    }

    let mut writer = Writer::new(Vec::new());
    write_element(&mut writer, &envelope)?;
    let body = String::from_utf8(writer.into_inner()).map_err(xml_error)?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body))
}

fn element_from(start: &BytesStart<'_>) -> Result<ZapiElement> {
    let mut element = ZapiElement::new(String::from_utf8_lossy(start.name().as_ref()));
    for attribute in start.attributes() {
        let attribute = attribute.map_err(xml_error)?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

/// Parse an XML document into its root element
pub fn decode_document(xml: &str) -> Result<ZapiElement> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<ZapiElement> = Vec::new();
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::Xml("unbalanced closing tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Eof => return Err(Error::Xml("document ended before root closed".into())),
            _ => {}
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Failure of a single ZAPI invocation
#[derive(Debug)]
pub enum ZapiFault {
    /// `<results status="failed">`
    Api { errno: u32, reason: String },
    /// The exchange itself failed
    Transport(Error),
}

impl From<Error> for ZapiFault {
    fn from(e: Error) -> Self {
        ZapiFault::Transport(e)
    }
}

impl From<reqwest::Error> for ZapiFault {
    fn from(e: reqwest::Error) -> Self {
        ZapiFault::Transport(Error::Transport(e))
    }
}

/// Extract `<results>` from a reply envelope
pub fn parse_results(root: ZapiElement) -> std::result::Result<ZapiElement, ZapiFault> {
    let results = root
        .children
        .into_iter()
        .find(|c| c.name == "results")
        .ok_or_else(|| ZapiFault::Transport(Error::Xml("reply has no results element".into())))?;
    if results.attribute("status") == Some("passed") {
        return Ok(results);
    }
    let errno = results
        .attribute("errno")
        .and_then(|e| e.parse().ok())
        .unwrap_or(0);
    let reason = results.attribute("reason").unwrap_or_default().to_string();
    Err(ZapiFault::Api { errno, reason })
}

/// One authenticated ZAPI session against the array
#[async_trait]
pub trait ZapiSession: Send + Sync {
    /// Invoke one API, optionally tunnelled to a vserver
    async fn invoke(
        &self,
        vserver: Option<&str>,
        request: ZapiElement,
    ) -> std::result::Result<ZapiElement, ZapiFault>;
}

/// ZAPI session over HTTPS with basic authentication
pub struct HttpZapiSession {
    client: reqwest::Client,
    url: String,
    version: String,
    user: String,
    password: String,
}

impl HttpZapiSession {
    pub fn new(credentials: &ArrayCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!credentials.verify_tls)
            .timeout(Duration::from_secs(credentials.timeout_secs()))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}{}", credentials.base_url(), ZAPI_SERVLET),
            version: credentials.zapi_version().to_string(),
            user: credentials.user.clone(),
            password: credentials.password.clone(),
        })
    }
}

#[async_trait]
impl ZapiSession for HttpZapiSession {
    async fn invoke(
        &self,
        vserver: Option<&str>,
        request: ZapiElement,
    ) -> std::result::Result<ZapiElement, ZapiFault> {
        debug!("ZAPI {} (vserver {:?})", request.name, vserver);
        let body = encode_request(&self.version, vserver, &request)?;
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        let text = response.text().await?;
        parse_results(decode_document(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_encode_request_envelope() {
        let request = ZapiElement::new("lun-map")
            .field("path", "/vol/v1/boot")
            .field("lun-id", 0);
        let xml = encode_request("1.31", Some("svm1"), &request).unwrap();
        assert!(xml.contains(r#"<netapp version="1.31" xmlns="http://www.netapp.com/filer/admin" vfiler="svm1">"#));
        assert!(xml.contains("<lun-map><path>/vol/v1/boot</path><lun-id>0</lun-id></lun-map>"));
    }

    #[test]
    fn test_encode_escapes_text() {
        let request = ZapiElement::new("snapshot-create").field("comment", "a<b & c");
        let xml = encode_request("1.31", None, &request).unwrap();
        assert!(xml.contains("a&lt;b &amp; c"));
        assert!(!xml.contains("vfiler"));
    }

    #[test]
    fn test_decode_passed_results() {
        let xml = r#"<?xml version='1.0' encoding='UTF-8'?>
<netapp version='1.31' xmlns='http://www.netapp.com/filer/admin'>
  <results status="passed">
    <attributes-list>
      <lun-info><path>/vol/v1/boot</path><comment>ubuntu &amp; co</comment></lun-info>
      <lun-info><path>/vol/v1/data</path><comment/></lun-info>
    </attributes-list>
    <num-records>2</num-records>
  </results>
</netapp>"#;
        let results = parse_results(decode_document(xml).unwrap()).unwrap();
        assert_eq!(results.child_text("num-records"), Some("2"));
        let luns: Vec<_> = results
            .child("attributes-list")
            .unwrap()
            .children_named("lun-info")
            .collect();
        assert_eq!(luns.len(), 2);
        assert_eq!(luns[0].child_text("comment"), Some("ubuntu & co"));
        assert_eq!(luns[1].child_text("comment"), Some(""));
    }

    #[test]
    fn test_decode_failed_results() {
        let xml = r#"<netapp version="1.31"><results status="failed" errno="15661" reason="entry doesn't exist"/></netapp>"#;
        let fault = parse_results(decode_document(xml).unwrap()).unwrap_err();
        assert_matches!(fault, ZapiFault::Api { errno: 15661, ref reason } if reason == "entry doesn't exist");
    }

    #[test]
    fn test_descend() {
        let element = ZapiElement::new("a").with(ZapiElement::new("b").field("c", "x"));
        assert_eq!(element.descend(&["b", "c"]).map(|e| e.text.as_str()), Some("x"));
        assert!(element.descend(&["b", "d"]).is_none());
    }
}
