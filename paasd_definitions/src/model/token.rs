#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OAuthBlob {
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
    pub scope: String,
    pub refresh_token: String,
}

/// An opaque key paired with an OAuth token blob.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub key: String,
    pub oauth: OAuthBlob,
}
