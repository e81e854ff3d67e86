// quire-common: wire types shared between the relay and its clients

pub mod protocol;
