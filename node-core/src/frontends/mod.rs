pub mod provider_embed;
