use rand::Rng;

/// Generate a buffer of random values
///
/// This is used to build client randoms, premaster
/// secrets and CredSSP nonces during the handshake
///
/// # Example
/// ```
/// use rdp::model::rnd::random;
/// let client_random = random(32);
/// assert_eq!(client_random.len(), 32);
/// ```
pub fn random(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}
