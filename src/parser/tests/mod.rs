mod message;
mod primitive;
