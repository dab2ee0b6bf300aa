pub trait Unicode {
    /// Convert any string into utf-16le string
    ///
    /// # Example
    /// ```
    /// use rdp::model::unicode::Unicode;
    /// let s = "foo".to_string();
    /// assert_eq!(s.to_unicode(), [102, 0, 111, 0, 111, 0])
    /// ```
    fn to_unicode(&self) -> Vec<u8>;
}

impl Unicode for String {
    fn to_unicode(&self) -> Vec<u8> {
        let mut result = Vec::new();
        for c in self.encode_utf16() {
            result.extend_from_slice(&c.to_le_bytes());
        }
        result
    }
}

impl Unicode for &str {
    fn to_unicode(&self) -> Vec<u8> {
        self.to_string().to_unicode()
    }
}
