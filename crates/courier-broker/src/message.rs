// Immutable message value passed from publishers to subscribers.
use bytes::Bytes;
use std::sync::Arc;

/// Ordered, multi-valued message headers.
///
/// ```
/// use courier_broker::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Trace-Id", "abc");
/// headers.insert("Trace-Id", "def");
/// assert_eq!(headers.get("Trace-Id"), Some("abc"));
/// assert_eq!(headers.get_all("Trace-Id").count(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    // Appends; existing values for the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
        self.entries
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// A published message. Cloning is cheap: every field is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    subject: Arc<str>,
    payload: Bytes,
    reply: Option<Arc<str>>,
    headers: Option<Arc<Headers>>,
}

impl Message {
    pub fn new(subject: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply: None,
            headers: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<Arc<str>>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(Arc::new(headers));
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let mut headers = Headers::new();
        headers.insert("k", "v");
        let message = Message::new("a.b", Bytes::from_static(b"hi"))
            .with_reply("_INBOX.x.y")
            .with_headers(headers);
        assert_eq!(message.subject(), "a.b");
        assert_eq!(message.payload().as_ref(), b"hi");
        assert_eq!(message.reply(), Some("_INBOX.x.y"));
        assert_eq!(message.headers().and_then(|h| h.get("k")), Some("v"));
    }

    #[test]
    fn headers_keep_insertion_order() {
        let headers: Headers = [("b", "1"), ("a", "2"), ("b", "3")].into_iter().collect();
        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("b", "1"), ("a", "2"), ("b", "3")]);
        assert_eq!(headers.get_all("b").collect::<Vec<_>>(), vec!["1", "3"]);
        assert_eq!(headers.get("missing"), None);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn header_values_outlive_the_lookup_name() {
        let headers: Headers = [("Trace-Id", "abc")].into_iter().collect();
        let value = {
            let name = String::from("Trace-Id");
            headers.get(&name)
        };
        assert_eq!(value, Some("abc"));
    }

    #[test]
    fn plain_message_has_no_reply_or_headers() {
        let message = Message::new("a", "payload");
        assert!(message.reply().is_none());
        assert!(message.headers().is_none());
        assert_eq!(message.into_payload(), Bytes::from_static(b"payload"));
    }
}
