#[macro_use]
extern crate afl;
use nereus::{Envelope, IdentityKeyPair, PreKey, PreKeyBundle, PreKeyStore, Session};

struct EmptyStore;

impl PreKeyStore for EmptyStore {
    type Error = String;

    fn load_prekey(&mut self, _id: u16) -> Result<Option<PreKey>, Self::Error> {
        Ok(None)
    }

    fn delete_prekey(&mut self, _id: u16) -> Result<(), Self::Error> {
        Ok(())
    }
}

fn get_session() -> Session {
    // The Victim
    let alice = IdentityKeyPair::new().expect("Setup failed");

    // The Attacker context
    let bob = IdentityKeyPair::new().expect("Setup failed");
    let bob_prekey = PreKey::new(1).expect("Setup failed");
    let bundle = PreKeyBundle::new(bob.public_key(), &bob_prekey);

    Session::init_from_prekey(alice, &bundle).expect("Setup failed")
}

fn main() {
    let mut session = get_session();
    let mut store = EmptyStore;

    fuzz!(|data: &[u8]| {
        if let Ok(envelope) = Envelope::deserialise(data) {
            let _ = session.decrypt(&mut store, &envelope);
        }
    });
}
